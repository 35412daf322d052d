use crate::error::{KvError, KvResult};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::fmt;

pub const MAX_KEY_LENGTH: usize = 256;
pub const MAX_VALUE_LENGTH: usize = 256 * 1024;

pub const SUCCESS: &str = "Success";

const ROOT: &str = "KVMessage";
const KEY: &str = "Key";
const VALUE: &str = "Value";
const MESSAGE: &str = "Message";
const TPC_OP_ID: &str = "TPCOpId";

/// Identifier the master assigns to one 2PC operation.
pub type OpId = u64;

/// One message on the wire. Every connection carries exactly one of these in
/// each direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KvMessage {
    // client (or master) asking for a value
    GetReq {
        key: String,
    },
    // client put, or the master's phase-1 put when op_id is set
    PutReq {
        key: String,
        value: String,
        op_id: Option<OpId>,
    },
    // client del, or the master's phase-1 del when op_id is set
    DelReq {
        key: String,
        op_id: Option<OpId>,
    },
    // generic reply carrying a status or error text
    Resp {
        message: String,
    },
    // successful get reply
    RespValue {
        key: String,
        value: String,
    },
    // 2PC messages:
    // slave voting to commit
    Ready {
        op_id: OpId,
    },
    // slave voting abort (message set) or master deciding abort (no message)
    Abort {
        message: Option<String>,
        op_id: OpId,
    },
    // master deciding commit
    Commit {
        op_id: OpId,
    },
    // slave acknowledging a decision
    Ack {
        op_id: OpId,
    },
    // slave announcing itself as "<id>@<host>:<port>"
    Register {
        message: String,
    },
    // makes the slave vote abort on its next request
    IgnoreNext,
}

impl KvMessage {
    pub fn resp(message: impl Into<String>) -> Self {
        KvMessage::Resp {
            message: message.into(),
        }
    }

    pub fn success() -> Self {
        Self::resp(SUCCESS)
    }

    /// The value of the root element's `type` attribute.
    pub fn type_name(&self) -> &'static str {
        match self {
            KvMessage::GetReq { .. } => "getreq",
            KvMessage::PutReq { .. } => "putreq",
            KvMessage::DelReq { .. } => "delreq",
            KvMessage::Resp { .. } | KvMessage::RespValue { .. } => "resp",
            KvMessage::Ready { .. } => "ready",
            KvMessage::Abort { .. } => "abort",
            KvMessage::Commit { .. } => "commit",
            KvMessage::Ack { .. } => "ack",
            KvMessage::Register { .. } => "register",
            KvMessage::IgnoreNext => "ignoreNext",
        }
    }

    pub fn op_id(&self) -> Option<OpId> {
        match self {
            KvMessage::PutReq { op_id, .. } | KvMessage::DelReq { op_id, .. } => *op_id,
            KvMessage::Ready { op_id }
            | KvMessage::Abort { op_id, .. }
            | KvMessage::Commit { op_id }
            | KvMessage::Ack { op_id } => Some(*op_id),
            _ => None,
        }
    }

    /// Copy of a put/del request stamped with a 2PC operation id.
    pub fn with_op_id(&self, id: OpId) -> Self {
        match self {
            KvMessage::PutReq { key, value, .. } => KvMessage::PutReq {
                key: key.clone(),
                value: value.clone(),
                op_id: Some(id),
            },
            KvMessage::DelReq { key, .. } => KvMessage::DelReq {
                key: key.clone(),
                op_id: Some(id),
            },
            other => other.clone(),
        }
    }

    pub fn to_xml(&self) -> KvResult<String> {
        let mut writer = Writer::new(Vec::new());
        write(&mut writer, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let root = BytesStart::new(ROOT).with_attributes([("type", self.type_name())]);
        if let KvMessage::IgnoreNext = self {
            write(&mut writer, Event::Empty(root))?;
            return finish(writer);
        }
        write(&mut writer, Event::Start(root))?;

        match self {
            KvMessage::GetReq { key } => {
                check_key(key)?;
                write_leaf(&mut writer, KEY, key)?;
            }
            KvMessage::PutReq { key, value, op_id } => {
                check_key_value(key, value)?;
                write_leaf(&mut writer, KEY, key)?;
                write_leaf(&mut writer, VALUE, value)?;
                if let Some(id) = op_id {
                    write_leaf(&mut writer, TPC_OP_ID, &id.to_string())?;
                }
            }
            KvMessage::DelReq { key, op_id } => {
                check_key(key)?;
                write_leaf(&mut writer, KEY, key)?;
                if let Some(id) = op_id {
                    write_leaf(&mut writer, TPC_OP_ID, &id.to_string())?;
                }
            }
            KvMessage::Resp { message } | KvMessage::Register { message } => {
                write_leaf(&mut writer, MESSAGE, message)?;
            }
            KvMessage::RespValue { key, value } => {
                write_leaf(&mut writer, KEY, key)?;
                write_leaf(&mut writer, VALUE, value)?;
            }
            KvMessage::Abort { message, op_id } => {
                if let Some(message) = message {
                    write_leaf(&mut writer, MESSAGE, message)?;
                }
                write_leaf(&mut writer, TPC_OP_ID, &op_id.to_string())?;
            }
            KvMessage::Ready { op_id } | KvMessage::Commit { op_id } | KvMessage::Ack { op_id } => {
                write_leaf(&mut writer, TPC_OP_ID, &op_id.to_string())?;
            }
            KvMessage::IgnoreNext => {}
        }

        write(&mut writer, Event::End(BytesEnd::new(ROOT)))?;
        finish(writer)
    }

    /// Parses and structurally validates one document.
    pub fn from_xml(input: &str) -> KvResult<Self> {
        let mut reader = Reader::from_str(input);
        let mut position = Position::Prolog { declared: false };
        let mut msg_type = String::new();
        let mut fields: Vec<(String, String)> = Vec::new();

        loop {
            let event = reader.read_event().map_err(|_| KvError::Xml)?;
            position = match (std::mem::replace(&mut position, Position::Epilog), event) {
                (current, Event::Eof) => {
                    if !matches!(current, Position::Epilog) {
                        return Err(KvError::Xml);
                    }
                    break;
                }
                (current, Event::Comment(_)) => current,
                (Position::Prolog { declared: false }, Event::Decl(decl)) => {
                    check_declaration(&decl)?;
                    Position::Prolog { declared: true }
                }
                (Position::Prolog { declared: true }, Event::Start(start)) => {
                    msg_type = root_type(&start)?;
                    Position::Root
                }
                (Position::Prolog { declared: true }, Event::Empty(start)) => {
                    msg_type = root_type(&start)?;
                    Position::Epilog
                }
                (Position::Root, Event::Start(start)) => {
                    if start.attributes().next().is_some() {
                        return Err(KvError::Format);
                    }
                    Position::Leaf {
                        name: element_name(&start)?,
                        text: None,
                    }
                }
                (Position::Root, Event::End(_)) => Position::Epilog,
                (Position::Leaf { name, text }, Event::Text(t)) => {
                    let chunk = t.unescape().map_err(|_| KvError::Xml)?;
                    let mut text = text.unwrap_or_default();
                    text.push_str(&chunk);
                    Position::Leaf {
                        name,
                        text: Some(text),
                    }
                }
                (Position::Leaf { name, text }, Event::End(_)) => {
                    fields.push((name, text.ok_or(KvError::Format)?));
                    Position::Root
                }
                (current, Event::Text(t)) if is_blank(&t) => current,
                // character data outside the root element is not a document
                (Position::Prolog { .. } | Position::Epilog, Event::Text(_) | Event::CData(_)) => {
                    return Err(KvError::Xml)
                }
                _ => return Err(KvError::Format),
            };
        }

        assemble(&msg_type, fields)
    }
}

impl fmt::Display for KvMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op_id() {
            Some(id) => write!(f, "{}#{}", self.type_name(), id),
            None => write!(f, "{}", self.type_name()),
        }
    }
}

enum Position {
    Prolog { declared: bool },
    Root,
    Leaf { name: String, text: Option<String> },
    Epilog,
}

fn check_declaration(decl: &BytesDecl<'_>) -> KvResult<()> {
    let version = decl.version().map_err(|_| KvError::Xml)?;
    let encoding = match decl.encoding() {
        Some(Ok(encoding)) => encoding,
        Some(Err(_)) => return Err(KvError::Xml),
        None => return Err(KvError::Format),
    };
    if version.as_ref() != b"1.0" || !encoding.as_ref().eq_ignore_ascii_case(b"UTF-8") {
        return Err(KvError::Format);
    }
    Ok(())
}

fn element_name(start: &BytesStart<'_>) -> KvResult<String> {
    std::str::from_utf8(start.name().as_ref())
        .map(str::to_string)
        .map_err(|_| KvError::Xml)
}

// root must be <KVMessage> with exactly one attribute, `type`
fn root_type(start: &BytesStart<'_>) -> KvResult<String> {
    if element_name(start)? != ROOT {
        return Err(KvError::Format);
    }
    let mut attributes = start.attributes();
    let attr = match (attributes.next(), attributes.next()) {
        (Some(Ok(attr)), None) => attr,
        (Some(Err(_)), _) => return Err(KvError::Xml),
        _ => return Err(KvError::Format),
    };
    if attr.key.as_ref() != b"type" {
        return Err(KvError::Format);
    }
    let value = attr.unescape_value().map_err(|_| KvError::Xml)?;
    Ok(value.into_owned())
}

fn is_blank(text: &BytesText<'_>) -> bool {
    text.iter().all(|b| b.is_ascii_whitespace())
}

fn assemble(msg_type: &str, fields: Vec<(String, String)>) -> KvResult<KvMessage> {
    let (names, values): (Vec<String>, Vec<String>) = fields.into_iter().unzip();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let mut values = values.into_iter();

    let msg = match (msg_type, names.as_slice()) {
        ("getreq", [KEY]) => KvMessage::GetReq {
            key: key_field(&mut values)?,
        },
        ("putreq", [KEY, VALUE]) | ("putreq", [KEY, VALUE, TPC_OP_ID]) => KvMessage::PutReq {
            key: key_field(&mut values)?,
            value: value_field(&mut values)?,
            op_id: values.next().map(|id| parse_op_id(&id)).transpose()?,
        },
        ("delreq", [KEY]) | ("delreq", [KEY, TPC_OP_ID]) => KvMessage::DelReq {
            key: key_field(&mut values)?,
            op_id: values.next().map(|id| parse_op_id(&id)).transpose()?,
        },
        ("resp", [MESSAGE]) => KvMessage::Resp {
            message: field(&mut values)?,
        },
        ("resp", [KEY, VALUE]) => KvMessage::RespValue {
            key: key_field(&mut values)?,
            value: value_field(&mut values)?,
        },
        ("ready", [TPC_OP_ID]) => KvMessage::Ready {
            op_id: op_id_field(&mut values)?,
        },
        ("abort", [TPC_OP_ID]) => KvMessage::Abort {
            message: None,
            op_id: op_id_field(&mut values)?,
        },
        ("abort", [MESSAGE, TPC_OP_ID]) => KvMessage::Abort {
            message: Some(field(&mut values)?),
            op_id: op_id_field(&mut values)?,
        },
        ("commit", [TPC_OP_ID]) => KvMessage::Commit {
            op_id: op_id_field(&mut values)?,
        },
        ("ack", [TPC_OP_ID]) => KvMessage::Ack {
            op_id: op_id_field(&mut values)?,
        },
        ("register", [MESSAGE]) => KvMessage::Register {
            message: field(&mut values)?,
        },
        ("ignoreNext", []) => KvMessage::IgnoreNext,
        _ => return Err(KvError::Format),
    };
    Ok(msg)
}

fn field(values: &mut impl Iterator<Item = String>) -> KvResult<String> {
    values.next().ok_or(KvError::Format)
}

fn key_field(values: &mut impl Iterator<Item = String>) -> KvResult<String> {
    let key = field(values)?;
    check_key(&key)?;
    Ok(key)
}

fn value_field(values: &mut impl Iterator<Item = String>) -> KvResult<String> {
    let value = field(values)?;
    check_value(&value)?;
    Ok(value)
}

fn op_id_field(values: &mut impl Iterator<Item = String>) -> KvResult<OpId> {
    parse_op_id(&field(values)?)
}

fn parse_op_id(raw: &str) -> KvResult<OpId> {
    raw.trim().parse().map_err(|_| KvError::Format)
}

fn write(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> KvResult<()> {
    writer
        .write_event(event)
        .map_err(|e| KvError::Unknown(format!("could not build XML: {e}")))
}

fn write_leaf(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> KvResult<()> {
    write(writer, Event::Start(BytesStart::new(name)))?;
    write(writer, Event::Text(BytesText::new(text)))?;
    write(writer, Event::End(BytesEnd::new(name)))
}

fn finish(writer: Writer<Vec<u8>>) -> KvResult<String> {
    String::from_utf8(writer.into_inner())
        .map_err(|_| KvError::Unknown("generated XML is not UTF-8".into()))
}

pub fn check_key(key: &str) -> KvResult<()> {
    // bounds count UTF-16 code units
    let len = key.encode_utf16().count();
    if len > MAX_KEY_LENGTH {
        return Err(KvError::OversizedKey);
    }
    if len == 0 {
        return Err(KvError::EmptyKey);
    }
    Ok(())
}

pub fn check_value(value: &str) -> KvResult<()> {
    let len = value.encode_utf16().count();
    if len > MAX_VALUE_LENGTH {
        return Err(KvError::OversizedValue);
    }
    if len == 0 {
        return Err(KvError::EmptyValue);
    }
    Ok(())
}

pub fn check_key_value(key: &str, value: &str) -> KvResult<()> {
    check_key(key)?;
    check_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

    fn doc(body: &str) -> String {
        format!("{HEADER}{body}")
    }

    #[test]
    fn test_put_request_survives_the_wire() {
        let msg = KvMessage::PutReq {
            key: "k <1>".into(),
            value: "v & w".into(),
            op_id: Some(42),
        };
        let xml = msg.to_xml().unwrap();
        assert!(xml.starts_with(HEADER));
        assert!(xml.contains(r#"<KVMessage type="putreq">"#));
        assert_eq!(KvMessage::from_xml(&xml).unwrap(), msg);
    }

    #[test]
    fn test_parses_handwritten_documents() {
        let get = doc(r#"<KVMessage type="getreq"><Key>a</Key></KVMessage>"#);
        assert_eq!(
            KvMessage::from_xml(&get).unwrap(),
            KvMessage::GetReq { key: "a".into() }
        );

        let vote = doc(
            r#"<KVMessage type="abort"><Message>no</Message><TPCOpId>7</TPCOpId></KVMessage>"#,
        );
        assert_eq!(
            KvMessage::from_xml(&vote).unwrap(),
            KvMessage::Abort {
                message: Some("no".into()),
                op_id: 7
            }
        );

        let decision = doc(r#"<KVMessage type="abort"><TPCOpId>7</TPCOpId></KVMessage>"#);
        assert_eq!(
            KvMessage::from_xml(&decision).unwrap(),
            KvMessage::Abort {
                message: None,
                op_id: 7
            }
        );
    }

    #[test]
    fn test_ignore_next_has_no_body() {
        let xml = KvMessage::IgnoreNext.to_xml().unwrap();
        assert_eq!(KvMessage::from_xml(&xml).unwrap(), KvMessage::IgnoreNext);

        let open_close = doc(r#"<KVMessage type="ignoreNext"></KVMessage>"#);
        assert_eq!(KvMessage::from_xml(&open_close).unwrap(), KvMessage::IgnoreNext);

        let with_child = doc(r#"<KVMessage type="ignoreNext"><Key>a</Key></KVMessage>"#);
        assert_eq!(KvMessage::from_xml(&with_child), Err(KvError::Format));
    }

    #[test]
    fn test_trailing_newline_is_tolerated() {
        let xml = format!("{}\n", KvMessage::success().to_xml().unwrap());
        assert_eq!(KvMessage::from_xml(&xml).unwrap(), KvMessage::success());
    }

    #[test]
    fn test_rejects_structural_violations() {
        let cases = [
            r#"<KVMessage type="getreq"></KVMessage>"#,
            r#"<KVMessage type="getreq"><Value>a</Value></KVMessage>"#,
            r#"<KVMessage type="putreq"><Value>v</Value><Key>k</Key></KVMessage>"#,
            r#"<KVMessage type="bogus"><Key>k</Key></KVMessage>"#,
            r#"<KVMessage kind="getreq"><Key>k</Key></KVMessage>"#,
            r#"<KVMessage type="getreq" extra="1"><Key>k</Key></KVMessage>"#,
            r#"<KVMessage type="getreq"><Key id="1">k</Key></KVMessage>"#,
            r#"<Other type="getreq"><Key>k</Key></Other>"#,
            r#"<KVMessage type="commit"><TPCOpId>abc</TPCOpId></KVMessage>"#,
            r#"<KVMessage type="getreq"><Key><Inner>k</Inner></Key></KVMessage>"#,
        ];
        for body in cases {
            assert_eq!(KvMessage::from_xml(&doc(body)), Err(KvError::Format), "{body}");
        }
    }

    #[test]
    fn test_rejects_missing_declaration() {
        let xml = r#"<KVMessage type="getreq"><Key>k</Key></KVMessage>"#;
        assert_eq!(KvMessage::from_xml(xml), Err(KvError::Format));
    }

    #[test]
    fn test_rejects_garbage_as_unparseable() {
        assert_eq!(KvMessage::from_xml(""), Err(KvError::Xml));
        assert_eq!(KvMessage::from_xml("not xml at all"), Err(KvError::Xml));
        assert_eq!(KvMessage::from_xml(&doc("plain text")), Err(KvError::Xml));
        let trailing = format!("{}junk", KvMessage::success().to_xml().unwrap());
        assert_eq!(KvMessage::from_xml(&trailing), Err(KvError::Xml));
        assert_eq!(
            KvMessage::from_xml(&doc(r#"<KVMessage type="getreq"><Key>k</Key>"#)),
            Err(KvError::Xml)
        );
    }

    #[test]
    fn test_size_limits_apply_in_both_directions() {
        let long_key = "k".repeat(MAX_KEY_LENGTH + 1);
        let msg = KvMessage::GetReq {
            key: long_key.clone(),
        };
        assert_eq!(msg.to_xml(), Err(KvError::OversizedKey));

        let raw = doc(&format!(
            r#"<KVMessage type="getreq"><Key>{long_key}</Key></KVMessage>"#
        ));
        assert_eq!(KvMessage::from_xml(&raw), Err(KvError::OversizedKey));

        let big_value = KvMessage::PutReq {
            key: "k".into(),
            value: "v".repeat(MAX_VALUE_LENGTH + 1),
            op_id: None,
        };
        assert_eq!(big_value.to_xml(), Err(KvError::OversizedValue));

        assert_eq!(check_key(""), Err(KvError::EmptyKey));
        assert_eq!(check_value(""), Err(KvError::EmptyValue));
        assert!(check_key_value(&"k".repeat(MAX_KEY_LENGTH), "v").is_ok());
    }

    #[test]
    fn test_astral_characters_count_twice() {
        let half = "\u{1F600}".repeat(MAX_KEY_LENGTH / 2);
        assert!(check_key(&half).is_ok());
        let over = format!("{half}k");
        assert_eq!(check_key(&over), Err(KvError::OversizedKey));
        assert_eq!(check_key(&"é".repeat(MAX_KEY_LENGTH)), Ok(()));
    }

    #[test]
    fn test_with_op_id_stamps_requests_only() {
        let put = KvMessage::PutReq {
            key: "k".into(),
            value: "v".into(),
            op_id: None,
        };
        assert_eq!(put.with_op_id(3).op_id(), Some(3));
        assert_eq!(KvMessage::success().with_op_id(3).op_id(), None);
    }
}
