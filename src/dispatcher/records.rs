//! Record operations on a single collection

use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;

use super::command::CreatePayload;
use crate::error::{DbError, DbResult};
use crate::store::document::{Document, FindOptions, Update, ID_FIELD};
use crate::store::{Collection, DeleteResult, UpdateResult};

/// Set when a document carries a compressed body
const COMPRESSED_FLAG: &str = "is_compressed";
const COMPRESSED_BODY: &str = "compressed_data";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertOneReceipt {
    pub acknowledged: bool,
    pub inserted_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertManyReceipt {
    pub acknowledged: bool,
    pub inserted_count: usize,
    pub inserted_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CreateReceipt {
    One(InsertOneReceipt),
    Many(InsertManyReceipt),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Existence {
    pub acknowledged: bool,
}

/// What a read returns: every document, or the first match
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReadResult {
    All(Vec<Document>),
    One(Document),
}

pub async fn create(collection: &dyn Collection, payload: &CreatePayload) -> DbResult<CreateReceipt> {
    match payload {
        CreatePayload::One(doc) => {
            let inserted_id = collection.insert_one(doc.clone()).await?;
            debug!("Inserted {} into {}", inserted_id, collection.collection_name());
            Ok(CreateReceipt::One(InsertOneReceipt {
                acknowledged: true,
                inserted_id,
            }))
        }
        CreatePayload::Many(docs) => {
            let inserted_ids = collection.insert_many(docs.clone()).await?;
            debug!("Inserted {} documents into {}", inserted_ids.len(), collection.collection_name());
            Ok(CreateReceipt::Many(InsertManyReceipt {
                acknowledged: true,
                inserted_count: inserted_ids.len(),
                inserted_ids,
            }))
        }
    }
}

/// Empty query lists the collection, anything else returns the first match
pub async fn read(collection: &dyn Collection, query: &Document) -> DbResult<ReadResult> {
    if query.is_empty() {
        let docs = collection.find(query, FindOptions::default()).await?;
        return Ok(ReadResult::All(docs.into_iter().map(present).collect()));
    }
    collection
        .find_one(query)
        .await?
        .map(|doc| ReadResult::One(present(doc)))
        .ok_or(DbError::NotFound)
}

/// Merge `fields` into the first document of the collection
pub async fn update(collection: &dyn Collection, fields: &Document) -> DbResult<UpdateResult> {
    if fields.is_empty() {
        return Err(DbError::InvalidPayload("update requires at least one field".to_string()));
    }
    Ok(collection.update_one(&Document::new(), &Update::Set(fields.clone())).await?)
}

pub async fn delete(collection: &dyn Collection, filter: &Document) -> DbResult<DeleteResult> {
    Ok(collection.delete_one(filter).await?)
}

pub async fn verify(collection: &dyn Collection, filter: &Document) -> DbResult<Existence> {
    let count = collection.count_documents(filter, Some(1)).await?;
    Ok(Existence { acknowledged: count > 0 })
}

pub async fn append(collection: &dyn Collection, existing: &Document, fields: &Document) -> DbResult<UpdateResult> {
    apply_to_existing(collection, existing, Update::Set(fields.clone())).await
}

pub async fn update_field(
    collection: &dyn Collection,
    existing: &Document,
    field: &str,
    value: &Value,
) -> DbResult<UpdateResult> {
    let mut fields = Document::new();
    fields.insert(field.to_string(), value.clone());
    apply_to_existing(collection, existing, Update::Set(fields)).await
}

pub async fn delete_field(collection: &dyn Collection, existing: &Document, field: &str) -> DbResult<UpdateResult> {
    apply_to_existing(collection, existing, Update::Unset(vec![field.to_string()])).await
}

// Check-then-act; a concurrent delete between the two calls yields matched_count 0
async fn apply_to_existing(collection: &dyn Collection, existing: &Document, update: Update) -> DbResult<UpdateResult> {
    if collection.find_one(existing).await?.is_none() {
        warn!("No record in {} matches {:?}", collection.collection_name(), existing);
        return Err(DbError::NotFound);
    }
    Ok(collection.update_one(existing, &update).await?)
}

/// Stringify the identifier and drop compressed bodies
fn present(mut doc: Document) -> Document {
    if let Some(id) = doc.get(ID_FIELD) {
        if !id.is_string() {
            let id = id.to_string();
            doc.insert(ID_FIELD.to_string(), Value::String(id));
        }
    }
    if doc.get(COMPRESSED_FLAG).is_some_and(is_truthy) {
        doc.remove(COMPRESSED_BODY);
    }
    doc
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory_store::MemoryStore;
    use crate::store::DocumentStore;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_present_strips_compressed_body() {
        let shown = present(doc(json!({"_id": 7, "is_compressed": true, "compressed_data": "xx", "name": "a"})));
        assert_eq!(shown["_id"], json!("7"));
        assert!(!shown.contains_key("compressed_data"));
        assert_eq!(shown["name"], json!("a"));

        let kept = present(doc(json!({"is_compressed": 0, "compressed_data": "xx"})));
        assert!(kept.contains_key("compressed_data"));
    }

    #[tokio::test]
    async fn test_read_all_and_one() {
        let store = MemoryStore::new();
        let coll = store.collection("DB", "notes");
        coll.insert_many(vec![doc(json!({"n": 1})), doc(json!({"n": 2}))]).await.unwrap();

        let ReadResult::All(all) = read(coll.as_ref(), &Document::new()).await.unwrap() else {
            panic!("expected all documents");
        };
        assert_eq!(all.len(), 2);

        let ReadResult::One(one) = read(coll.as_ref(), &doc(json!({"n": 2}))).await.unwrap() else {
            panic!("expected one document");
        };
        assert_eq!(one["n"], json!(2));

        assert!(matches!(read(coll.as_ref(), &doc(json!({"n": 3}))).await, Err(DbError::NotFound)));
    }

    #[tokio::test]
    async fn test_field_operations_need_existing_record() {
        let store = MemoryStore::new();
        let coll = store.collection("DB", "notes");
        coll.insert_one(doc(json!({"name": "a", "old": true}))).await.unwrap();

        let result = append(coll.as_ref(), &doc(json!({"name": "a"})), &doc(json!({"extra": 1}))).await.unwrap();
        assert_eq!(result.modified_count, 1);

        update_field(coll.as_ref(), &doc(json!({"name": "a"})), "extra", &json!(2)).await.unwrap();
        delete_field(coll.as_ref(), &doc(json!({"name": "a"})), "old").await.unwrap();

        let stored = coll.find_one(&doc(json!({"name": "a"}))).await.unwrap().unwrap();
        assert_eq!(stored["extra"], json!(2));
        assert!(!stored.contains_key("old"));

        let missing = doc(json!({"name": "b"}));
        assert!(matches!(append(coll.as_ref(), &missing, &doc(json!({"x": 1}))).await, Err(DbError::NotFound)));
        assert!(matches!(delete_field(coll.as_ref(), &missing, "name").await, Err(DbError::NotFound)));
        assert_eq!(store.document_count("DB", "notes"), 1);
    }

    #[tokio::test]
    async fn test_update_targets_first_document() {
        let store = MemoryStore::new();
        let coll = store.collection("DB", "notes");
        coll.insert_many(vec![doc(json!({"n": 1})), doc(json!({"n": 2}))]).await.unwrap();

        let result = update(coll.as_ref(), &doc(json!({"seen": true}))).await.unwrap();
        assert_eq!(result.matched_count, 1);
        assert!(coll.find_one(&doc(json!({"n": 1, "seen": true}))).await.unwrap().is_some());
        assert!(coll.find_one(&doc(json!({"n": 2, "seen": true}))).await.unwrap().is_none());

        assert!(verify(coll.as_ref(), &doc(json!({"n": 2}))).await.unwrap().acknowledged);
        assert!(!verify(coll.as_ref(), &doc(json!({"n": 9}))).await.unwrap().acknowledged);
    }
}
