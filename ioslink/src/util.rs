//! Small helpers shared by the codecs

use plist::Value;

/// Renders a plist value as an indented, human readable tree for logging
pub fn pretty_print_plist(p: &Value) -> String {
    print_plist(p, 0)
}

/// Renders a plist dictionary as an indented, human readable tree for logging
pub fn pretty_print_dictionary(dict: &plist::Dictionary) -> String {
    let items: Vec<String> = dict
        .iter()
        .map(|(k, v)| format!("{}{}: {}", indent(1), k, print_plist(v, 1)))
        .collect();
    format!("{{\n{}\n}}", items.join(",\n"))
}

fn indent(level: usize) -> String {
    "  ".repeat(level)
}

fn print_plist(p: &Value, level: usize) -> String {
    match p {
        Value::Array(arr) => {
            if arr.is_empty() {
                return "[]".to_string();
            }
            let items: Vec<String> = arr
                .iter()
                .map(|v| format!("{}{}", indent(level + 1), print_plist(v, level + 1)))
                .collect();
            format!("[\n{}\n{}]", items.join(",\n"), indent(level))
        }
        Value::Dictionary(dict) => {
            if dict.is_empty() {
                return "{}".to_string();
            }
            let items: Vec<String> = dict
                .iter()
                .map(|(k, v)| {
                    format!(
                        "{}{}: {}",
                        indent(level + 1),
                        k,
                        print_plist(v, level + 1)
                    )
                })
                .collect();
            format!("{{\n{}\n{}}}", items.join(",\n"), indent(level))
        }
        Value::Boolean(b) => b.to_string(),
        Value::Data(d) => format!("<{} bytes>", d.len()),
        Value::Date(d) => format!("\"{}\"", d.to_xml_format()),
        Value::Real(f) => f.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::String(s) => format!("\"{s}\""),
        Value::Uid(u) => format!("Uid({})", u.get()),
        _ => "unknown".to_string(),
    }
}

/// Follows `path` through nested dictionaries
pub(crate) fn plist_path<'a>(v: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(v, |v, k| v.as_dictionary()?.get(k))
}

/// Builds a dictionary value from key/value pairs
pub(crate) fn plist_dict<const N: usize>(entries: [(&str, Value); N]) -> Value {
    Value::Dictionary(
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    )
}

/// Serializes a plist value into its XML representation
pub fn plist_to_xml_bytes(p: &Value) -> Result<Vec<u8>, plist::Error> {
    let mut buf = Vec::new();
    p.to_writer_xml(&mut buf)?;
    Ok(buf)
}

/// Serializes a plist value into its binary representation
pub fn plist_to_binary_bytes(p: &Value) -> Result<Vec<u8>, plist::Error> {
    let mut buf = Vec::new();
    p.to_writer_binary(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pretty_print_nests() {
        let mut inner = plist::Dictionary::new();
        inner.insert("Port".into(), "50340".into());
        let mut outer = plist::Dictionary::new();
        outer.insert("Services".into(), Value::Dictionary(inner));
        outer.insert("Data".into(), Value::Data(vec![1, 2, 3]));

        let printed = pretty_print_dictionary(&outer);
        assert!(printed.contains("Port: \"50340\""));
        assert!(printed.contains("<3 bytes>"));
    }

    #[test]
    fn path_walks_nested_dictionaries() {
        let v = plist_dict([(
            "response",
            plist_dict([("_1", plist_dict([("port", Value::Integer(7.into()))]))]),
        )]);
        assert_eq!(
            plist_path(&v, &["response", "_1", "port"]).and_then(|p| p.as_unsigned_integer()),
            Some(7)
        );
        assert!(plist_path(&v, &["response", "_0"]).is_none());
        assert_eq!(plist_path(&v, &[]), Some(&v));
    }

    #[test]
    fn plist_codec_idempotence() {
        let mut dict = plist::Dictionary::new();
        dict.insert("bool".into(), true.into());
        dict.insert("int".into(), Value::Integer((-42_i64).into()));
        dict.insert("real".into(), Value::Real(1.5));
        dict.insert("data".into(), Value::Data(vec![0, 1, 2, 255]));
        dict.insert("string".into(), "hello".into());
        dict.insert(
            "date".into(),
            Value::Date(plist::Date::from(
                std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000),
            )),
        );
        dict.insert(
            "array".into(),
            Value::Array(vec![Value::Integer(1.into()), "two".into()]),
        );
        let value = Value::Dictionary(dict);

        let xml = plist_to_xml_bytes(&value).unwrap();
        let decoded: Value = plist::from_bytes(&xml).unwrap();
        assert_eq!(decoded, value);

        let binary = plist_to_binary_bytes(&value).unwrap();
        let decoded: Value = plist::from_bytes(&binary).unwrap();
        assert_eq!(decoded, value);
    }
}
