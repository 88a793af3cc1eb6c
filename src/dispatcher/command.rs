//! Typed commands
//!
//! The wire carries a command string and a loosely shaped `data` value.
//! Both are turned into a `Command` here, before any store work happens, so
//! malformed requests fail without touching the connection.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{DbError, DbResult};
use crate::objects::NewObject;
use crate::store::document::{timestamp_value, Document};

pub const PRIVACY_FIELD: &str = "isPrivate";
pub const CREATED_AT_FIELD: &str = "created_at";

/// The closed command vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Create,
    Read,
    Update,
    Delete,
    Verify,
    Append,
    UpdateField,
    DeleteField,
    CreateObject,
    DeleteObject,
    GetObject,
}

impl CommandKind {
    pub const ALL: [CommandKind; 11] = [
        CommandKind::Create,
        CommandKind::Read,
        CommandKind::Update,
        CommandKind::Delete,
        CommandKind::Verify,
        CommandKind::Append,
        CommandKind::UpdateField,
        CommandKind::DeleteField,
        CommandKind::CreateObject,
        CommandKind::DeleteObject,
        CommandKind::GetObject,
    ];

    /// Wire identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Create => "--create",
            CommandKind::Read => "--read",
            CommandKind::Update => "--update",
            CommandKind::Delete => "--delete",
            CommandKind::Verify => "--verify",
            CommandKind::Append => "--append",
            CommandKind::UpdateField => "--update-field",
            CommandKind::DeleteField => "--delete-field",
            CommandKind::CreateObject => "--create_video",
            CommandKind::DeleteObject => "--delete_video",
            CommandKind::GetObject => "--get_video",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DbError::InvalidCommand(s.to_string()))
    }
}

/// Documents to insert for `--create`
#[derive(Debug, Clone, PartialEq)]
pub enum CreatePayload {
    One(Document),
    Many(Vec<Document>),
}

#[derive(Debug, Clone)]
pub enum Command {
    Create(CreatePayload),
    Read(Document),
    Update(Document),
    Delete(Document),
    Verify(Document),
    Append { existing: Document, append: Document },
    UpdateField { existing: Document, field: String, value: Value },
    DeleteField { existing: Document, field: String },
    CreateObject(NewObject),
    DeleteObject { id: String },
    GetObject { id: String },
}

impl Command {
    /// Validate and type the payload of a command, normalizing create defaults
    pub fn parse(kind: CommandKind, data: Value, now: DateTime<Utc>) -> DbResult<Self> {
        let command = match kind {
            CommandKind::Create => Command::Create(create_payload(data, now)?),
            CommandKind::Read => Command::Read(optional_object(data, "read query")?),
            CommandKind::Update => Command::Update(optional_object(data, "update fields")?),
            CommandKind::Delete => Command::Delete(optional_object(data, "delete filter")?),
            CommandKind::Verify => Command::Verify(optional_object(data, "verify filter")?),
            CommandKind::Append => {
                let mut data = required_object(data, "append")?;
                Command::Append {
                    existing: take_object(&mut data, "existing")?,
                    append: take_object(&mut data, "append")?,
                }
            }
            CommandKind::UpdateField => {
                let mut data = required_object(data, "update-field")?;
                let existing = take_object(&mut data, "existing")?;
                let field = take_field_name(&mut data)?;
                let value = match data.remove("value") {
                    Some(Value::Null) | None => return Err(DbError::MissingField("value".to_string())),
                    Some(value) => value,
                };
                Command::UpdateField { existing, field, value }
            }
            CommandKind::DeleteField => {
                let mut data = required_object(data, "delete-field")?;
                Command::DeleteField {
                    existing: take_object(&mut data, "existing")?,
                    field: take_field_name(&mut data)?,
                }
            }
            CommandKind::CreateObject => Command::CreateObject(NewObject::from_request(data)?),
            CommandKind::DeleteObject => Command::DeleteObject { id: object_id(data)? },
            CommandKind::GetObject => Command::GetObject { id: object_id(data)? },
        };
        Ok(command)
    }
}

/// Default the privacy flag to true and stamp the creation time
pub fn normalize_record(doc: &mut Document, now: DateTime<Utc>) {
    match doc.get(PRIVACY_FIELD) {
        Some(Value::Null) | None => {
            doc.insert(PRIVACY_FIELD.to_string(), Value::Bool(true));
        }
        Some(_) => {}
    }
    if !doc.contains_key(CREATED_AT_FIELD) {
        doc.insert(CREATED_AT_FIELD.to_string(), timestamp_value(now));
    }
}

fn create_payload(data: Value, now: DateTime<Utc>) -> DbResult<CreatePayload> {
    match data {
        Value::Object(mut doc) => {
            normalize_record(&mut doc, now);
            Ok(CreatePayload::One(doc))
        }
        Value::Array(items) => {
            if items.is_empty() {
                return Err(DbError::InvalidPayload("create requires at least one document".to_string()));
            }
            let docs = items
                .into_iter()
                .enumerate()
                .map(|(i, item)| match item {
                    Value::Object(mut doc) => {
                        normalize_record(&mut doc, now);
                        Ok(doc)
                    }
                    _ => Err(DbError::InvalidPayload(format!("create item {} is not an object", i))),
                })
                .collect::<DbResult<Vec<_>>>()?;
            Ok(CreatePayload::Many(docs))
        }
        _ => Err(DbError::InvalidPayload("create expects an object or an array of objects".to_string())),
    }
}

/// Null means "no filter"
fn optional_object(data: Value, what: &str) -> DbResult<Document> {
    match data {
        Value::Null => Ok(Document::new()),
        Value::Object(doc) => Ok(doc),
        _ => Err(DbError::InvalidPayload(format!("{} must be an object", what))),
    }
}

fn required_object(data: Value, command: &str) -> DbResult<Document> {
    match data {
        Value::Object(doc) => Ok(doc),
        _ => Err(DbError::InvalidPayload(format!("{} expects an object payload", command))),
    }
}

fn take_object(data: &mut Document, field: &str) -> DbResult<Document> {
    match data.remove(field) {
        Some(Value::Object(doc)) => Ok(doc),
        Some(Value::Null) | None => Err(DbError::MissingField(field.to_string())),
        Some(_) => Err(DbError::InvalidPayload(format!("'{}' must be an object", field))),
    }
}

fn take_field_name(data: &mut Document) -> DbResult<String> {
    match data.remove("field") {
        Some(Value::String(field)) if !field.is_empty() => Ok(field),
        Some(Value::String(_)) | Some(Value::Null) | None => Err(DbError::MissingField("field".to_string())),
        Some(_) => Err(DbError::InvalidPayload("'field' must be a string".to_string())),
    }
}

fn object_id(data: Value) -> DbResult<String> {
    match data {
        Value::Object(mut doc) => match doc.remove("id") {
            Some(Value::String(id)) if !id.is_empty() => Ok(id),
            Some(Value::String(_)) | Some(Value::Null) | None => Err(DbError::MissingField("id".to_string())),
            Some(_) => Err(DbError::InvalidPayload("'id' must be a string".to_string())),
        },
        _ => Err(DbError::MissingField("id".to_string())),
    }
}
