use std::io;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("malformed XML: {0}")]
    Malformed(String),
    #[error("document has no root element")]
    Empty,
    #[error("unexpected content after the root element")]
    TrailingContent,
}

/// Serializes a JSON tree into a wire document with the given root element.
///
/// Objects become child elements, arrays repeated sibling elements, scalars
/// text nodes. The translator is format-agnostic with respect to field
/// naming; callers supply the action-specific root element name.
pub fn json_to_xml(root: &str, value: &Value) -> String {
    let mut writer = Writer::new(Vec::new());
    // Writing into a Vec cannot fail.
    let _ = write_element(&mut writer, root, value);
    String::from_utf8_lossy(&writer.into_inner()).into_owned()
}

fn write_element<W: io::Write>(writer: &mut Writer<W>, name: &str, value: &Value) -> io::Result<()> {
    match value {
        Value::Array(items) => {
            for item in items {
                write_element(writer, name, item)?;
            }
        }
        Value::Object(fields) => {
            writer.write_event(Event::Start(BytesStart::new(name)))?;
            for (child, child_value) in fields {
                write_element(writer, child, child_value)?;
            }
            writer.write_event(Event::End(BytesEnd::new(name)))?;
        }
        scalar => {
            let text = match scalar {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            writer.write_event(Event::Start(BytesStart::new(name)))?;
            if !text.is_empty() {
                writer.write_event(Event::Text(BytesText::new(&text)))?;
            }
            writer.write_event(Event::End(BytesEnd::new(name)))?;
        }
    }
    Ok(())
}

/// Parses a wire document back into `(root_name, tree)`.
///
/// Leaf elements become strings, elements with children objects. Repeated
/// sibling elements are always exposed as a JSON array, so relational
/// collections come back as a sequence regardless of how many members they
/// have. Use [`as_sequence`] at the boundary for collections that may arrive
/// as a bare element.
pub fn xml_to_json(xml: &str) -> Result<(String, Value), XmlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    struct Node {
        name: String,
        children: Map<String, Value>,
        text: String,
    }

    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<(String, Value)> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                if root.is_some() && stack.is_empty() {
                    return Err(XmlError::TrailingContent);
                }
                stack.push(Node {
                    name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
                    children: Map::new(),
                    text: String::new(),
                });
            }
            Ok(Event::Empty(empty)) => {
                let name = String::from_utf8_lossy(empty.name().as_ref()).into_owned();
                let value = Value::String(String::new());
                match stack.last_mut() {
                    Some(parent) => insert_child(&mut parent.children, name, value),
                    None => {
                        if root.is_some() {
                            return Err(XmlError::TrailingContent);
                        }
                        root = Some((name, value));
                    }
                }
            }
            Ok(Event::Text(text)) => {
                if let Some(node) = stack.last_mut() {
                    let unescaped = text
                        .unescape()
                        .map_err(|e| XmlError::Malformed(e.to_string()))?;
                    node.text.push_str(&unescaped);
                }
            }
            Ok(Event::CData(cdata)) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(&cdata));
                }
            }
            Ok(Event::End(_)) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| XmlError::Malformed("unbalanced end tag".to_string()))?;
                let value = if node.children.is_empty() {
                    Value::String(node.text.trim().to_string())
                } else {
                    Value::Object(node.children)
                };
                match stack.last_mut() {
                    Some(parent) => insert_child(&mut parent.children, node.name, value),
                    None => root = Some((node.name, value)),
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(XmlError::Malformed(e.to_string())),
        }
    }

    if !stack.is_empty() {
        return Err(XmlError::Malformed("unclosed element".to_string()));
    }
    root.ok_or(XmlError::Empty)
}

fn insert_child(children: &mut Map<String, Value>, name: String, value: Value) {
    match children.get_mut(&name) {
        Some(Value::Array(existing)) => existing.push(value),
        Some(first) => {
            let first = first.take();
            children.insert(name, Value::Array(vec![first, value]));
        }
        None => {
            children.insert(name, value);
        }
    }
}

/// Coerces a decoded value into a sequence: arrays yield their members, a
/// bare element yields itself, null/absent yields nothing.
pub fn as_sequence(value: &Value) -> Vec<&Value> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_nested_payload() {
        let payload = json!({
            "ActionType": "CREATE",
            "FirstName": "Jane",
            "Business": { "BusinessName": "Acme" }
        });
        let xml = json_to_xml("UserMessage", &payload);
        assert_eq!(
            xml,
            "<UserMessage><ActionType>CREATE</ActionType>\
             <Business><BusinessName>Acme</BusinessName></Business>\
             <FirstName>Jane</FirstName></UserMessage>"
        );
    }

    #[test]
    fn round_trips_field_values() {
        let payload = json!({
            "ActionType": "CREATE",
            "UUID": "2025-05-13T13:37:05.000123Z",
            "FirstName": "Jane",
            "EmailAddress": "jane@x.com",
            "EncryptedPassword": ""
        });
        let xml = json_to_xml("UserMessage", &payload);
        let (root, decoded) = xml_to_json(&xml).unwrap();
        assert_eq!(root, "UserMessage");
        assert_eq!(decoded["UUID"], payload["UUID"]);
        assert_eq!(decoded["FirstName"], payload["FirstName"]);
        assert_eq!(decoded["EmailAddress"], payload["EmailAddress"]);
        assert_eq!(decoded["EncryptedPassword"], json!(""));
    }

    #[test]
    fn escapes_reserved_characters() {
        let payload = json!({ "Name": "A <&> B" });
        let xml = json_to_xml("Doc", &payload);
        assert!(xml.contains("A &lt;&amp;&gt; B"));
        let (_, decoded) = xml_to_json(&xml).unwrap();
        assert_eq!(decoded["Name"], json!("A <&> B"));
    }

    #[test]
    fn repeated_siblings_become_a_sequence() {
        let xml = "<RegisteredUsers><User><UUID>a</UUID></User>\
                   <User><UUID>b</UUID></User></RegisteredUsers>";
        let (_, decoded) = xml_to_json(xml).unwrap();
        let users = as_sequence(&decoded["User"]);
        assert_eq!(users.len(), 2);
        assert_eq!(users[1]["UUID"], json!("b"));
    }

    #[test]
    fn single_member_collections_are_still_sequences() {
        let xml = "<RegisteredUsers><User><UUID>a</UUID></User></RegisteredUsers>";
        let (_, decoded) = xml_to_json(xml).unwrap();
        let users = as_sequence(&decoded["User"]);
        assert_eq!(users.len(), 1);
        assert_eq!(users[0]["UUID"], json!("a"));
    }

    #[test]
    fn numbers_coerce_to_text_on_the_wire() {
        let xml = json_to_xml("Doc", &json!({ "Capacity": 25 }));
        let (_, decoded) = xml_to_json(&xml).unwrap();
        assert_eq!(decoded["Capacity"], json!("25"));
    }

    #[test]
    fn rejects_malformed_documents() {
        assert!(xml_to_json("<open><unclosed>").is_err());
        assert!(xml_to_json("not xml at all").is_err());
    }
}
