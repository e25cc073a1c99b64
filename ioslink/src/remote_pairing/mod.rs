//! iOS 17+ remote pairing
//!
//! Runs the control channel of the untrusted tunnel service: pair-verify with
//! a known identity, falling back once to manual pair-setup (SRP), and then
//! the encrypted requests that set up a tunnel listener.

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use idevice_srp::{client::SrpClient, groups::G_3072};
use plist::Value;
use rand::RngCore;
use rsa::rand_core::OsRng;
use serde_json::json;
use sha2::Sha512;
use tracing::{debug, info, warn};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

use crate::{
    LinkError,
    util::{plist_dict, plist_path},
};

pub mod cipher;
pub mod identity;
pub mod opack;
pub mod socket;
pub mod tlv;

pub use cipher::CipherStream;
pub use identity::{DevicePairRecord, SelfIdentity};
pub use socket::{RPPAIRING_MAGIC, RpPairingSocket, RpPairingSocketProvider};

use tlv::{TlvEntry, TlvType, state};

/// Service carrying the control channel over RemoteXPC
pub const UNTRUSTED_TUNNEL_SERVICE: &str =
    "com.apple.internal.dt.coredevice.untrusted.tunnelservice";
pub const WIRE_PROTOCOL_VERSION: u64 = 19;

const SRP_USERNAME: &[u8] = b"Pair-Setup";
const SRP_PASSWORD: &[u8] = b"000000";

/// Transport the device should listen with for the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Quic,
    Tcp,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Quic => "quic",
            TransportProtocol::Tcp => "tcp",
        }
    }
}

/// The device's answer to `createListener`
#[derive(Debug, Clone)]
pub struct TunnelListener {
    pub port: u16,
    /// DER SubjectPublicKeyInfo the device will present
    pub device_public_key: Vec<u8>,
}

/// How [`RemotePairingClient::connect`] got to a session key
#[derive(Debug, Clone, PartialEq)]
pub enum PairOutcome {
    /// The device already knew this host
    Verified,
    /// Manual pairing ran; the record should be saved for next time
    Paired(DevicePairRecord),
}

pub struct RemotePairingClient<R: RpPairingSocketProvider> {
    inner: R,
    sequence_number: u64,
    identity: SelfIdentity,
    cipher: Option<CipherStream>,
    /// Raw session key, the pre-shared key of the TCP tunnel
    session_key: Option<Vec<u8>>,
}

impl<R: RpPairingSocketProvider> RemotePairingClient<R> {
    pub fn new(inner: R, identity: SelfIdentity) -> Self {
        Self {
            inner,
            sequence_number: 1,
            identity,
            cipher: None,
            session_key: None,
        }
    }

    /// Sequence number the next envelope will carry
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn identity(&self) -> &SelfIdentity {
        &self.identity
    }

    /// Brings the control channel to an encrypted session.
    ///
    /// Tries pair-verify first, with `known` used to authenticate the device
    /// when the host has a record for it. If the device declines, manual
    /// pairing runs once.
    pub async fn connect(
        &mut self,
        known: Option<&DevicePairRecord>,
        udid: &str,
    ) -> Result<PairOutcome, LinkError> {
        self.handshake().await?;

        match self.pair_verify(known).await {
            Ok(key) => {
                self.cipher = Some(CipherStream::new(&key)?);
                self.session_key = Some(key);
                info!("Pair verify with {udid} succeeded");
                Ok(PairOutcome::Verified)
            }
            Err(LinkError::CertificateRejected) => {
                info!("{udid} does not know this host, starting manual pairing");
                let (key, record) = self.pair_setup(udid).await?;
                self.cipher = Some(CipherStream::new(&key)?);
                self.session_key = Some(key);
                info!("Paired with {udid}");
                Ok(PairOutcome::Paired(record))
            }
            Err(e) => Err(e),
        }
    }

    /// Opens the control channel, returning the device's handshake reply
    pub async fn handshake(&mut self) -> Result<Value, LinkError> {
        debug!("Sending handshake");
        self.send_plain(plist_dict([(
            "request",
            plist_dict([(
                "_0",
                plist_dict([(
                    "handshake",
                    plist_dict([(
                        "_0",
                        plist_dict([
                            (
                                "hostOptions",
                                plist_dict([("attemptPairVerify", true.into())]),
                            ),
                            ("wireProtocolVersion", WIRE_PROTOCOL_VERSION.into()),
                        ]),
                    )]),
                )]),
            )]),
        )]))
        .await?;

        let response = self.recv_plain().await?;
        match plist_path(&response, &["response", "_1", "handshake", "_0"]) {
            Some(v) => Ok(v.to_owned()),
            None => {
                warn!("Handshake reply has no handshake body");
                Err(LinkError::UnexpectedResponse)
            }
        }
    }

    /// Pair-verify, returning the session key.
    ///
    /// Fails with [`LinkError::CertificateRejected`] when either side does
    /// not recognize the other, after telling the device so.
    pub async fn pair_verify(
        &mut self,
        known: Option<&DevicePairRecord>,
    ) -> Result<Vec<u8>, LinkError> {
        let x_private = EphemeralSecret::random_from_rng(OsRng);
        let x_public = X25519PublicKey::from(&x_private);

        self.send_pairing_data(
            &[
                TlvEntry::state(state::START_REQUEST),
                TlvEntry::new(TlvType::PublicKey, x_public.as_bytes().to_vec()),
            ],
            "verifyManualPairing",
            true,
        )
        .await?;

        debug!("Waiting for verify start response");
        let entries = self.receive_tlv().await?;
        if tlv::has_error(&entries) {
            debug!("Device declined pair verify");
            self.send_pair_verify_failed().await?;
            return Err(LinkError::CertificateRejected);
        }

        let device_public: [u8; 32] = tlv::read_coalesced(&entries, TlvType::PublicKey)
            .and_then(|k| k.try_into().ok())
            .ok_or_else(|| {
                warn!("Verify start response lacks a 32 byte public key");
                LinkError::UnexpectedResponse
            })?;
        let device_public = X25519PublicKey::from(device_public);
        let shared = x_private.diffie_hellman(&device_public);

        let key = cipher::derive_key(
            shared.as_bytes(),
            Some(b"Pair-Verify-Encrypt-Salt".as_slice()),
            b"Pair-Verify-Encrypt-Info",
        )?;

        if let Some(record) = known {
            let sealed = tlv::read_coalesced(&entries, TlvType::EncryptedData).unwrap_or_default();
            if !device_proof_matches(&key, &sealed, record, &device_public, &x_public) {
                warn!("Device failed to prove it is {}", record.udid);
                self.send_pair_verify_failed().await?;
                return Err(LinkError::CertificateRejected);
            }
        }

        let mut signbuf = Vec::with_capacity(64 + self.identity.identifier().len());
        signbuf.extend_from_slice(x_public.as_bytes());
        signbuf.extend_from_slice(self.identity.identifier().as_bytes());
        signbuf.extend_from_slice(device_public.as_bytes());
        let signature = self.identity.sign(&signbuf);

        let plaintext = tlv::serialize_tlv8(&[
            TlvEntry::new(TlvType::Identifier, self.identity.identifier().as_bytes()),
            TlvEntry::new(TlvType::Signature, signature.to_bytes().to_vec()),
        ]);
        let sealed = cipher::seal(&key, &cipher::labeled_nonce(b"PV-Msg03"), &plaintext)?;

        self.send_pairing_data(
            &[
                TlvEntry::state(state::VERIFY_REQUEST),
                TlvEntry::new(TlvType::EncryptedData, sealed),
            ],
            "verifyManualPairing",
            false,
        )
        .await?;

        let entries = self.receive_tlv().await?;
        debug!("Verify finish TLV: {entries:?}");
        if tlv::has_error(&entries) {
            debug!("Device does not recognize this host's identity");
            self.send_pair_verify_failed().await?;
            return Err(LinkError::CertificateRejected);
        }

        Ok(shared.as_bytes().to_vec())
    }

    pub async fn send_pair_verify_failed(&mut self) -> Result<(), LinkError> {
        self.send_plain(plist_dict([(
            "event",
            plist_dict([(
                "_0",
                plist_dict([("pairVerifyFailed", plist_dict([]))]),
            )]),
        )]))
        .await
    }

    /// Manual pair-setup, returning the SRP session key and the device's
    /// record
    pub async fn pair_setup(&mut self, udid: &str) -> Result<(Vec<u8>, DevicePairRecord), LinkError> {
        let (salt, device_srp_public) = self.request_pair_consent().await?;
        let session_key = self.srp_exchange(&salt, &device_srp_public).await?;
        let record = self.exchange_device_info(&session_key, udid).await?;
        Ok((session_key, record))
    }

    /// Returns the SRP salt and the device's public value B
    async fn request_pair_consent(&mut self) -> Result<(Vec<u8>, Vec<u8>), LinkError> {
        self.send_pairing_data(
            &[
                TlvEntry::new(TlvType::Method, [0x00]),
                TlvEntry::state(state::START_REQUEST),
            ],
            "setupManualPairing",
            true,
        )
        .await?;

        let event = self.receive_event().await?;
        let data = if let Some(err) = plist_path(&event, &["pairingRejectedWithError"]) {
            return Err(pairing_rejected(err));
        } else if plist_path(&event, &["awaitingUserConsent"]).is_some() {
            info!("Waiting for the user to trust this host on the device");
            self.receive_pairing_data().await?
        } else {
            // Some devices skip the consent event
            plist_path(&event, &["pairingData", "_0", "data"])
                .cloned()
                .and_then(R::deserialize_bytes)
                .ok_or(LinkError::UnexpectedResponse)?
        };

        let entries = tlv::deserialize_tlv8(&data)?;
        if tlv::has_error(&entries) {
            warn!("Pair setup start carried an error: {entries:?}");
            return Err(LinkError::PairingRejected(
                "device refused to start pair setup".into(),
            ));
        }
        match (
            tlv::read_coalesced(&entries, TlvType::Salt),
            tlv::read_coalesced(&entries, TlvType::PublicKey),
        ) {
            (Some(salt), Some(b)) if !salt.is_empty() && !b.is_empty() => Ok((salt, b)),
            _ => {
                warn!("Pair setup start lacks salt or public key");
                Err(LinkError::UnexpectedResponse)
            }
        }
    }

    /// Runs SRP-6a and returns the shared key
    async fn srp_exchange(&mut self, salt: &[u8], device_public: &[u8]) -> Result<Vec<u8>, LinkError> {
        let client = SrpClient::<Sha512>::new(&G_3072);

        let mut a_private = [0u8; 32];
        rand::rng().fill_bytes(&mut a_private);
        let a_public = client.compute_public_ephemeral(&a_private);

        let verifier = client
            .process_reply(
                &a_private,
                SRP_USERNAME,
                SRP_PASSWORD,
                salt,
                device_public,
                false,
            )
            .map_err(|e| {
                warn!("SRP verifier creation failed: {e:?}");
                LinkError::HandshakeFailure("SRP reply was invalid".into())
            })?;

        self.send_pairing_data(
            &[
                TlvEntry::state(state::VERIFY_REQUEST),
                TlvEntry::new(TlvType::PublicKey, a_public),
                TlvEntry::new(TlvType::Proof, verifier.proof().to_vec()),
            ],
            "setupManualPairing",
            false,
        )
        .await?;

        let entries = self.receive_tlv().await?;
        if tlv::has_error(&entries) {
            warn!("Device rejected the SRP proof");
            return Err(LinkError::HandshakeFailure("SRP proof rejected".into()));
        }
        let proof = tlv::read_coalesced(&entries, TlvType::Proof).ok_or_else(|| {
            warn!("Proof response did not contain the device proof");
            LinkError::UnexpectedResponse
        })?;

        verifier.verify_server(&proof).map_err(|e| {
            warn!("Device proof failed: {e:?}");
            LinkError::HandshakeFailure("device SRP proof did not verify".into())
        })?;
        Ok(verifier.key().to_vec())
    }

    async fn exchange_device_info(
        &mut self,
        session_key: &[u8],
        udid: &str,
    ) -> Result<DevicePairRecord, LinkError> {
        let setup_key = cipher::derive_key(
            session_key,
            Some(b"Pair-Setup-Encrypt-Salt".as_slice()),
            b"Pair-Setup-Encrypt-Info",
        )?;
        let controller = cipher::derive_key(
            session_key,
            Some(b"Pair-Setup-Controller-Sign-Salt".as_slice()),
            b"Pair-Setup-Controller-Sign-Info",
        )?;

        let identifier = self.identity.identifier().to_string();
        let public_key = self.identity.public_key().to_bytes();

        let mut signbuf = Vec::with_capacity(controller.len() + identifier.len() + 32);
        signbuf.extend_from_slice(&controller);
        signbuf.extend_from_slice(identifier.as_bytes());
        signbuf.extend_from_slice(&public_key);
        let signature = self.identity.sign(&signbuf);

        let mut alt_irk = [0u8; 16];
        rand::rng().fill_bytes(&mut alt_irk);
        let device_info = opack::plist_to_opack(&plist_dict([
            ("accountID", identifier.clone().into()),
            ("altIRK", Value::Data(alt_irk.to_vec())),
            ("btAddr", "11:22:33:44:55:66".into()),
            ("mac", Value::Data(vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66])),
            ("model", "computer-model".into()),
            ("name", self.identity.hostname().into()),
            ("remotepairing_serial_number", "AAAAAAAAAAAA".into()),
        ]))?;

        let plaintext = tlv::serialize_tlv8(&[
            TlvEntry::new(TlvType::Identifier, identifier.as_bytes()),
            TlvEntry::new(TlvType::PublicKey, public_key.to_vec()),
            TlvEntry::new(TlvType::Signature, signature.to_bytes().to_vec()),
            TlvEntry::new(TlvType::Info, device_info),
        ]);
        let sealed = cipher::seal(&setup_key, &cipher::labeled_nonce(b"PS-Msg05"), &plaintext)?;
        debug!("Sending {} bytes of sealed device info", sealed.len());

        self.send_pairing_data(
            &[
                TlvEntry::state(state::EXCHANGE_REQUEST),
                TlvEntry::new(TlvType::EncryptedData, sealed),
            ],
            "setupManualPairing",
            false,
        )
        .await?;

        let entries = self.receive_tlv().await?;
        if tlv::has_error(&entries) {
            warn!("Device rejected our device info: {entries:?}");
            return Err(LinkError::PairingRejected(
                "device rejected the host identity".into(),
            ));
        }
        let sealed = tlv::read_coalesced(&entries, TlvType::EncryptedData)
            .ok_or(LinkError::UnexpectedResponse)?;
        let plaintext = cipher::open(&setup_key, &cipher::labeled_nonce(b"PS-Msg06"), &sealed)?;
        let entries = tlv::deserialize_tlv8(&plaintext)?;
        debug!("Device info TLV: {entries:?}");

        let device_identifier = tlv::read_coalesced(&entries, TlvType::Identifier)
            .and_then(|i| String::from_utf8(i).ok())
            .ok_or(LinkError::UnexpectedResponse)?;
        let device_key: [u8; 32] = tlv::read_coalesced(&entries, TlvType::PublicKey)
            .and_then(|k| k.try_into().ok())
            .ok_or(LinkError::UnexpectedResponse)?;

        Ok(DevicePairRecord {
            udid: udid.to_string(),
            identifier: device_identifier,
            public_key: VerifyingKey::from_bytes(&device_key)
                .map_err(|e| LinkError::Decode(format!("device public key: {e}")))?,
            info: tlv::read_coalesced(&entries, TlvType::Info).unwrap_or_default(),
        })
    }

    /// Seals a JSON request with the session cipher and sends it
    pub async fn send_encrypted(&mut self, payload: &serde_json::Value) -> Result<(), LinkError> {
        let cipher = self
            .cipher
            .as_mut()
            .ok_or(LinkError::NoEstablishedConnection)?;
        let sealed = cipher.encrypt(&serde_json::to_vec(payload)?)?;
        debug!("Sending encrypted {payload}");

        let message = plist_dict([(
            "streamEncrypted",
            plist_dict([("_0", R::serialize_bytes(&sealed))]),
        )]);
        self.inner
            .send_envelope(message, self.sequence_number)
            .await?;
        self.sequence_number += 1;
        Ok(())
    }

    /// Reads the device's sealed answer to the last request
    pub async fn recv_encrypted(&mut self) -> Result<serde_json::Value, LinkError> {
        let message = self.inner.recv_envelope().await?;
        let cipher = self.cipher.as_ref().ok_or(LinkError::NoEstablishedConnection)?;
        let sealed = plist_path(&message, &["streamEncrypted", "_0"])
            .cloned()
            .and_then(R::deserialize_bytes)
            .ok_or_else(|| {
                warn!("Expected an encrypted message");
                LinkError::UnexpectedResponse
            })?;
        let res: serde_json::Value = serde_json::from_slice(&cipher.decrypt(&sealed)?)?;
        debug!("Received encrypted {res}");
        Ok(res)
    }

    /// Asks the device to listen for a tunnel authenticated by `key_der`, the
    /// DER SubjectPublicKeyInfo of the host's tunnel key
    pub async fn create_listener(
        &mut self,
        key_der: &[u8],
        transport: TransportProtocol,
    ) -> Result<TunnelListener, LinkError> {
        self.send_encrypted(&json!({
            "request": {"_0": {"createListener": {
                "key": B64.encode(key_der),
                "transportProtocolType": transport.as_str(),
            }}}
        }))
        .await?;

        let res = self.recv_encrypted().await?;
        let listener = &res["response"]["_1"]["createListener"];
        let port = listener["port"]
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| {
                LinkError::TunnelSetupFailed(format!("createListener returned no port: {res}"))
            })?;
        let device_public_key = listener["devicePublicKey"]
            .as_str()
            .and_then(|k| B64.decode(k).ok())
            .unwrap_or_default();
        info!("Device listening for the tunnel on port {port}");
        Ok(TunnelListener {
            port,
            device_public_key,
        })
    }

    /// Requests a remote unlock key and returns its bytes
    pub async fn create_remote_unlock_key(&mut self) -> Result<Vec<u8>, LinkError> {
        self.send_encrypted(&json!({"request": {"_0": {"createRemoteUnlockKey": {}}}}))
            .await?;
        let res = self.recv_encrypted().await?;
        res["response"]["_1"]["createRemoteUnlockKey"]["hostKey"]
            .as_str()
            .and_then(|k| B64.decode(k).ok())
            .ok_or_else(|| {
                warn!("No unlock key in {res}");
                LinkError::UnexpectedResponse
            })
    }

    /// The session key's cipher, once pairing is done
    pub fn cipher(&self) -> Option<&CipherStream> {
        self.cipher.as_ref()
    }

    /// The key both sides agreed on, once pairing is done
    pub fn session_key(&self) -> Option<&[u8]> {
        self.session_key.as_deref()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    async fn send_plain(&mut self, payload: Value) -> Result<(), LinkError> {
        let message = plist_dict([("plain", plist_dict([("_0", payload)]))]);
        self.inner
            .send_envelope(message, self.sequence_number)
            .await?;
        self.sequence_number += 1;
        Ok(())
    }

    async fn recv_plain(&mut self) -> Result<Value, LinkError> {
        self.inner
            .recv_envelope()
            .await?
            .into_dictionary()
            .and_then(|mut x| x.remove("plain"))
            .and_then(|x| x.into_dictionary())
            .and_then(|mut x| x.remove("_0"))
            .ok_or(LinkError::UnexpectedResponse)
    }

    async fn send_pairing_data(
        &mut self,
        entries: &[TlvEntry],
        kind: &str,
        start_new_session: bool,
    ) -> Result<(), LinkError> {
        let data = R::serialize_bytes(&tlv::serialize_tlv8(entries));
        let pairing_data = plist_dict([
            ("data", data),
            ("kind", kind.into()),
            ("sendingHost", self.identity.hostname().into()),
            ("startNewSession", start_new_session.into()),
        ]);
        self.send_plain(plist_dict([(
            "event",
            plist_dict([(
                "_0",
                plist_dict([("pairingData", plist_dict([("_0", pairing_data)]))]),
            )]),
        )]))
        .await
    }

    /// The body of the next event
    async fn receive_event(&mut self) -> Result<Value, LinkError> {
        let msg = self.recv_plain().await?;
        match plist_path(&msg, &["event", "_0"]) {
            Some(e) => Ok(e.to_owned()),
            None => {
                warn!("Expected an event, got {}", crate::pretty_print_plist(&msg));
                Err(LinkError::UnexpectedResponse)
            }
        }
    }

    async fn receive_pairing_data(&mut self) -> Result<Vec<u8>, LinkError> {
        let event = self.receive_event().await?;
        if let Some(data) = plist_path(&event, &["pairingData", "_0", "data"]) {
            R::deserialize_bytes(data.to_owned()).ok_or(LinkError::UnexpectedResponse)
        } else if let Some(err) = plist_path(&event, &["pairingRejectedWithError"]) {
            Err(pairing_rejected(err))
        } else {
            Err(LinkError::UnexpectedResponse)
        }
    }

    async fn receive_tlv(&mut self) -> Result<Vec<TlvEntry>, LinkError> {
        tlv::deserialize_tlv8(&self.receive_pairing_data().await?)
    }
}

fn pairing_rejected(err: &Value) -> LinkError {
    let context = plist_path(
        err,
        &["wrappedError", "userInfo", "NSLocalizedDescription"],
    )
    .and_then(|x| x.as_string())
    .unwrap_or_default();
    warn!("Device rejected pairing: {context}");
    LinkError::PairingRejected(context.to_string())
}

/// Checks the device's sealed signature over `(device ‖ identifier ‖ host)`
fn device_proof_matches(
    key: &[u8; 32],
    sealed: &[u8],
    record: &DevicePairRecord,
    device_public: &X25519PublicKey,
    host_public: &X25519PublicKey,
) -> bool {
    let Ok(plaintext) = cipher::open(key, &cipher::labeled_nonce(b"PV-Msg02"), sealed) else {
        return false;
    };
    let Ok(entries) = tlv::deserialize_tlv8(&plaintext) else {
        return false;
    };
    let (Some(identifier), Some(signature)) = (
        tlv::read_coalesced(&entries, TlvType::Identifier),
        tlv::read_coalesced(&entries, TlvType::Signature),
    ) else {
        return false;
    };
    if identifier != record.identifier.as_bytes() {
        return false;
    }
    let Ok(signature) = Signature::from_slice(&signature) else {
        return false;
    };

    let mut signed = Vec::with_capacity(64 + identifier.len());
    signed.extend_from_slice(device_public.as_bytes());
    signed.extend_from_slice(&identifier);
    signed.extend_from_slice(host_public.as_bytes());
    record.public_key.verify(&signed, &signature).is_ok()
}

impl<R: RpPairingSocketProvider> std::fmt::Debug for RemotePairingClient<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePairingClient")
            .field("inner", &self.inner)
            .field("sequence_number", &self.sequence_number)
            .field("identity", &self.identity)
            .field("encrypted", &self.cipher.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Device end of an RPPairing connection
    struct FakePairingDevice {
        socket: DuplexStream,
        expected_seq: u64,
    }

    impl FakePairingDevice {
        async fn read(&mut self) -> serde_json::Value {
            let mut header = [0u8; 11];
            self.socket.read_exact(&mut header).await.unwrap();
            assert_eq!(&header[..9], RPPAIRING_MAGIC);
            let mut body = vec![0u8; u16::from_be_bytes([header[9], header[10]]) as usize];
            self.socket.read_exact(&mut body).await.unwrap();
            let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(v["originatedBy"], "host");
            assert_eq!(v["sequenceNumber"], self.expected_seq);
            self.expected_seq += 1;
            v["message"].clone()
        }

        async fn write(&mut self, message: serde_json::Value) {
            let body = serde_json::to_vec(&json!({
                "message": message,
                "originatedBy": "device",
                "sequenceNumber": 0,
            }))
            .unwrap();
            self.socket.write_all(RPPAIRING_MAGIC).await.unwrap();
            self.socket
                .write_all(&(body.len() as u16).to_be_bytes())
                .await
                .unwrap();
            self.socket.write_all(&body).await.unwrap();
        }

        async fn read_pairing_data(&mut self, kind: &str) -> Vec<tlv::TlvEntry> {
            let m = self.read().await;
            let pd = &m["plain"]["_0"]["event"]["_0"]["pairingData"]["_0"];
            assert_eq!(pd["kind"], kind);
            let data = B64.decode(pd["data"].as_str().unwrap()).unwrap();
            tlv::deserialize_tlv8(&data).unwrap()
        }

        async fn write_pairing_data(&mut self, entries: &[TlvEntry]) {
            let data = B64.encode(tlv::serialize_tlv8(entries));
            self.write(json!({"plain": {"_0": {"event": {"_0": {
                "pairingData": {"_0": {"data": data, "kind": "verifyManualPairing", "startNewSession": false}}
            }}}}}))
            .await;
        }

        async fn answer_handshake(&mut self) {
            let m = self.read().await;
            let hs = &m["plain"]["_0"]["request"]["_0"]["handshake"]["_0"];
            assert_eq!(hs["hostOptions"]["attemptPairVerify"], true);
            assert_eq!(hs["wireProtocolVersion"], 19);
            self.write(json!({"plain": {"_0": {"response": {"_1": {"handshake": {"_0": {
                "peerDeviceInfo": {"name": "phone"}
            }}}}}}}))
            .await;
        }
    }

    fn device_side() -> (SigningKey, DevicePairRecord) {
        let key = SigningKey::generate(&mut OsRng);
        let record = DevicePairRecord {
            udid: "udid0".into(),
            identifier: "DEVICE-IDENTIFIER".into(),
            public_key: key.verifying_key(),
            info: Vec::new(),
        };
        (key, record)
    }

    #[tokio::test]
    async fn verify_then_encrypted_create_listener() {
        let (host, device) = tokio::io::duplex(1 << 16);
        let identity = SelfIdentity::generate("test-host");
        let host_key = identity.public_key();
        let host_identifier = identity.identifier().to_string();
        let (device_key, record) = device_side();
        let device_identifier = record.identifier.clone();

        let device_task = tokio::spawn(async move {
            let mut d = FakePairingDevice {
                socket: device,
                expected_seq: 1,
            };
            d.answer_handshake().await;

            let start = d.read_pairing_data("verifyManualPairing").await;
            let host_x: [u8; 32] = tlv::read_coalesced(&start, TlvType::PublicKey)
                .unwrap()
                .try_into()
                .unwrap();
            let host_x = X25519PublicKey::from(host_x);
            let dev_secret = EphemeralSecret::random_from_rng(OsRng);
            let dev_x = X25519PublicKey::from(&dev_secret);
            let shared = dev_secret.diffie_hellman(&host_x);
            let key = cipher::derive_key(
                shared.as_bytes(),
                Some(b"Pair-Verify-Encrypt-Salt".as_slice()),
                b"Pair-Verify-Encrypt-Info",
            )
            .unwrap();

            let mut signed = dev_x.as_bytes().to_vec();
            signed.extend_from_slice(device_identifier.as_bytes());
            signed.extend_from_slice(host_x.as_bytes());
            let proof = tlv::serialize_tlv8(&[
                TlvEntry::new(TlvType::Identifier, device_identifier.as_bytes()),
                TlvEntry::new(TlvType::Signature, device_key.sign(&signed).to_bytes().to_vec()),
            ]);
            let sealed = cipher::seal(&key, &cipher::labeled_nonce(b"PV-Msg02"), &proof).unwrap();
            d.write_pairing_data(&[
                TlvEntry::state(state::START_RESPONSE),
                TlvEntry::new(TlvType::PublicKey, dev_x.as_bytes().to_vec()),
                TlvEntry::new(TlvType::EncryptedData, sealed),
            ])
            .await;

            let finish = d.read_pairing_data("verifyManualPairing").await;
            let sealed = tlv::read_coalesced(&finish, TlvType::EncryptedData).unwrap();
            let inner = tlv::deserialize_tlv8(
                &cipher::open(&key, &cipher::labeled_nonce(b"PV-Msg03"), &sealed).unwrap(),
            )
            .unwrap();
            let id = tlv::read_coalesced(&inner, TlvType::Identifier).unwrap();
            assert_eq!(id, host_identifier.as_bytes());
            let sig = Signature::from_slice(&tlv::read_coalesced(&inner, TlvType::Signature).unwrap())
                .unwrap();
            let mut signed = host_x.as_bytes().to_vec();
            signed.extend_from_slice(&id);
            signed.extend_from_slice(dev_x.as_bytes());
            host_key.verify(&signed, &sig).unwrap();
            d.write_pairing_data(&[TlvEntry::state(state::VERIFY_RESPONSE)])
                .await;

            // Encrypted createListener under counter 0
            let client_key =
                cipher::derive_key(shared.as_bytes(), None, b"ClientEncrypt-main").unwrap();
            let server_key =
                cipher::derive_key(shared.as_bytes(), None, b"ServerEncrypt-main").unwrap();
            let m = d.read().await;
            let sealed = B64
                .decode(m["streamEncrypted"]["_0"].as_str().unwrap())
                .unwrap();
            let req: serde_json::Value = serde_json::from_slice(
                &cipher::open(&client_key, &cipher::counter_nonce(0), &sealed).unwrap(),
            )
            .unwrap();
            let cl = &req["request"]["_0"]["createListener"];
            assert_eq!(cl["transportProtocolType"], "quic");
            assert_eq!(B64.decode(cl["key"].as_str().unwrap()).unwrap(), b"spki");

            let reply = serde_json::to_vec(&json!({"response": {"_1": {"createListener": {
                "port": 50123, "devicePublicKey": B64.encode(b"device-spki")
            }}}}))
            .unwrap();
            let sealed = cipher::seal(&server_key, &cipher::counter_nonce(0), &reply).unwrap();
            d.write(json!({"streamEncrypted": {"_0": B64.encode(sealed)}}))
                .await;
        });

        let mut client = RemotePairingClient::new(RpPairingSocket::new(host), identity);
        let outcome = client.connect(Some(&record), "udid0").await.unwrap();
        assert_eq!(outcome, PairOutcome::Verified);
        assert_eq!(client.session_key().map(|k| k.len()), Some(32));

        let listener = client
            .create_listener(b"spki", TransportProtocol::Quic)
            .await
            .unwrap();
        assert_eq!(listener.port, 50123);
        assert_eq!(listener.device_public_key, b"device-spki");
        // handshake, two verify messages, one encrypted request
        assert_eq!(client.sequence_number(), 5);
        assert_eq!(client.cipher().map(|c| c.counter()), Some(1));
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn declined_verify_falls_through_to_rejected_setup() {
        let (host, device) = tokio::io::duplex(1 << 16);
        let device_task = tokio::spawn(async move {
            let mut d = FakePairingDevice {
                socket: device,
                expected_seq: 1,
            };
            d.answer_handshake().await;
            d.read_pairing_data("verifyManualPairing").await;
            d.write_pairing_data(&[
                TlvEntry::state(state::START_RESPONSE),
                TlvEntry::new(TlvType::ErrorResponse, [0x02]),
            ])
            .await;

            let m = d.read().await;
            assert!(m["plain"]["_0"]["event"]["_0"]["pairVerifyFailed"].is_object());

            let start = d.read_pairing_data("setupManualPairing").await;
            assert_eq!(tlv::read_coalesced(&start, TlvType::Method), Some(vec![0]));
            assert_eq!(
                tlv::read_coalesced(&start, TlvType::State),
                Some(vec![state::START_REQUEST])
            );
            d.write(json!({"plain": {"_0": {"event": {"_0": {"pairingRejectedWithError": {
                "wrappedError": {"userInfo": {"NSLocalizedDescription": "Pairing is not allowed"}}
            }}}}}}))
            .await;
        });

        let mut client = RemotePairingClient::new(
            RpPairingSocket::new(host),
            SelfIdentity::generate("test-host"),
        );
        match client.connect(None, "udid0").await {
            Err(LinkError::PairingRejected(msg)) => assert_eq!(msg, "Pairing is not allowed"),
            other => panic!("unexpected {other:?}"),
        }
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn impostor_device_fails_verify() {
        let (host, device) = tokio::io::duplex(1 << 16);
        let (_, record) = device_side();
        let device_task = tokio::spawn(async move {
            let mut d = FakePairingDevice {
                socket: device,
                expected_seq: 1,
            };
            d.answer_handshake().await;
            d.read_pairing_data("verifyManualPairing").await;
            let dev_x = X25519PublicKey::from(&EphemeralSecret::random_from_rng(OsRng));
            d.write_pairing_data(&[
                TlvEntry::state(state::START_RESPONSE),
                TlvEntry::new(TlvType::PublicKey, dev_x.as_bytes().to_vec()),
                TlvEntry::new(TlvType::EncryptedData, vec![0u8; 80]),
            ])
            .await;
            let m = d.read().await;
            assert!(m["plain"]["_0"]["event"]["_0"]["pairVerifyFailed"].is_object());
        });

        let mut client = RemotePairingClient::new(
            RpPairingSocket::new(host),
            SelfIdentity::generate("test-host"),
        );
        client.handshake().await.unwrap();
        assert!(matches!(
            client.pair_verify(Some(&record)).await,
            Err(LinkError::CertificateRejected)
        ));
        device_task.await.unwrap();
    }
}
