//! Wire codecs
//!
//! One command record per input line. Three interchangeable formats,
//! chosen at startup: a JSON object, tab-separated key/value pairs, or a
//! bash associative array as dumped by `declare -p`. Each codec also
//! encodes the error records the layer reports on its error stream.

use serde_json::{Map, Value};

use super::CommandError;

/// A decoded command record: field name to (loosely typed) value.
pub type Record = Map<String, Value>;

/// Line format of the command stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecKind {
    /// One JSON object per line.
    #[default]
    Json,
    /// Keys and values separated by tabs.
    Simple,
    /// A bash associative array dumped via `declare -p`.
    Bash,
}

impl CodecKind {
    pub fn name(self) -> &'static str {
        match self {
            CodecKind::Json => "json",
            CodecKind::Simple => "simple",
            CodecKind::Bash => "bash",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "json" => Some(CodecKind::Json),
            "simple" => Some(CodecKind::Simple),
            "bash" => Some(CodecKind::Bash),
            _ => None,
        }
    }

    /// Decodes one command record from a line (without the newline).
    pub fn decode(self, line: &str) -> Result<Record, CommandError> {
        match self {
            CodecKind::Json => decode_json(line),
            CodecKind::Simple => decode_simple(line),
            CodecKind::Bash => decode_bash(line),
        }
    }

    /// Encodes one record as a single line (without the newline).
    pub fn encode(self, record: &Record) -> String {
        match self {
            CodecKind::Json => Value::Object(record.clone()).to_string(),
            CodecKind::Simple => encode_simple(record),
            CodecKind::Bash => encode_bash(record),
        }
    }
}

/// Builds the error record reported for a failed command.
pub fn error_record(name: &str, message: &str) -> Record {
    let mut record = Record::new();
    record.insert("type".into(), Value::String("error".into()));
    record.insert("name".into(), Value::String(name.into()));
    record.insert("message".into(), Value::String(message.into()));
    record
}

fn decode_json(line: &str) -> Result<Record, CommandError> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(CommandError::Decode(format!(
            "expected a JSON object, got {other}"
        ))),
        Err(error) => Err(CommandError::Decode(error.to_string())),
    }
}

fn decode_simple(line: &str) -> Result<Record, CommandError> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() % 2 != 0 {
        return Err(CommandError::Decode(
            "expected an even number of tab-separated fields".into(),
        ));
    }

    let mut record = Record::new();
    for pair in fields.chunks(2) {
        record.insert(pair[0].to_string(), Value::String(pair[1].to_string()));
    }
    Ok(record)
}

fn encode_simple(record: &Record) -> String {
    let mut fields = Vec::with_capacity(record.len() * 2);
    for (key, value) in record {
        fields.push(key.clone());
        fields.push(plain_value(value));
    }
    fields.join("\t")
}

/// Accepts `declare -A name=([key]="value" ...)` as produced by
/// `declare -p` on an associative array.
fn decode_bash(line: &str) -> Result<Record, CommandError> {
    let open = line
        .find('(')
        .ok_or_else(|| CommandError::Decode("missing '(' in declare line".into()))?;
    let close = line
        .rfind(')')
        .ok_or_else(|| CommandError::Decode("missing ')' in declare line".into()))?;
    if close < open {
        return Err(CommandError::Decode("malformed declare line".into()));
    }

    let tokens = shlex::split(&line[open + 1..close])
        .ok_or_else(|| CommandError::Decode("unbalanced quoting in declare line".into()))?;

    let mut record = Record::new();
    for token in tokens {
        let Some(rest) = token.strip_prefix('[') else {
            return Err(CommandError::Decode(format!(
                "expected [key]=value, got '{token}'"
            )));
        };
        let Some((key, value)) = rest.split_once("]=") else {
            return Err(CommandError::Decode(format!(
                "expected [key]=value, got '{token}'"
            )));
        };
        record.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok(record)
}

fn encode_bash(record: &Record) -> String {
    let mut line = String::from("declare -A response=(");
    for (key, value) in record {
        let quoted = shlex::try_quote(&plain_value(value))
            .map(|v| v.into_owned())
            .unwrap_or_default();
        line.push_str(&format!("[{key}]={quoted} "));
    }
    line.push(')');
    line
}

fn plain_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_object_decodes() {
        let record = CodecKind::Json
            .decode(r#"{"action":"add","identifier":"a","x":1,"y":2,"path":"/tmp/a.png"}"#)
            .expect("valid json");
        assert_eq!(record["action"], Value::String("add".into()));
        assert_eq!(record["x"], Value::Number(1.into()));
    }

    #[test]
    fn json_non_object_is_a_decode_error() {
        assert!(matches!(
            CodecKind::Json.decode("[1,2]"),
            Err(CommandError::Decode(_))
        ));
        assert!(matches!(
            CodecKind::Json.decode("{broken"),
            Err(CommandError::Decode(_))
        ));
    }

    #[test]
    fn simple_pairs_decode() {
        let record = CodecKind::Simple
            .decode("action\tadd\tidentifier\ta\tx\t3")
            .expect("valid simple line");
        assert_eq!(record["action"], Value::String("add".into()));
        assert_eq!(record["x"], Value::String("3".into()));

        assert!(CodecKind::Simple.decode("action\tadd\tdangling").is_err());
    }

    #[test]
    fn bash_declare_decodes() {
        let line = r#"declare -A cmd=([action]="add" [identifier]="a b" [x]="1" )"#;
        let record = CodecKind::Bash.decode(line).expect("valid declare line");
        assert_eq!(record["action"], Value::String("add".into()));
        assert_eq!(record["identifier"], Value::String("a b".into()));
        assert_eq!(record["x"], Value::String("1".into()));
    }

    #[test]
    fn error_record_round_trips_through_each_codec() {
        let record = error_record("ValidationError", "x must be an integer");
        for codec in [CodecKind::Json, CodecKind::Simple, CodecKind::Bash] {
            let line = codec.encode(&record);
            let decoded = codec.decode(&line).expect("own output decodes");
            assert_eq!(decoded["type"], Value::String("error".into()));
            assert_eq!(decoded["name"], Value::String("ValidationError".into()));
        }
    }
}
