//! Comprehensive test to verify both drivers behave the same way

#[cfg(test)]
mod integration_tests {
    use crate::store::document::{Document, FindOptions, SortOrder, Update};
    use crate::store::{ConnectionOptions, Connector, DocumentStore, UriConnector};
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn stores() -> (tempfile::TempDir, Vec<(&'static str, Arc<dyn DocumentStore>)>) {
        let dir = tempfile::tempdir().unwrap();
        let sqlite_uri = format!("sqlite://{}", dir.path().join("conformance.db").display());
        let options = ConnectionOptions::default();
        let stores = vec![
            ("memory", UriConnector.connect("memory://", &options).unwrap()),
            ("sqlite", UriConnector.connect(&sqlite_uri, &options).unwrap()),
        ];
        (dir, stores)
    }

    #[tokio::test]
    async fn test_driver_crud_end_to_end() {
        let (_dir, stores) = stores();
        for (name, store) in stores {
            println!("Testing with driver: {}", name);
            let coll = store.collection("ConformanceDB", "people");

            // Insert in order
            let ids = coll
                .insert_many(vec![
                    doc(json!({"name": "ada", "age": 36, "tags": ["math"]})),
                    doc(json!({"name": "alan", "age": 41})),
                    doc(json!({"name": "grace", "age": 85, "profile": {"navy": true}})),
                ])
                .await
                .unwrap();
            assert_eq!(ids.len(), 3);

            // Natural order is insertion order
            let all = coll.find(&Document::new(), FindOptions::default()).await.unwrap();
            let names: Vec<_> = all.iter().map(|d| d["name"].as_str().unwrap().to_string()).collect();
            assert_eq!(names, vec!["ada", "alan", "grace"], "driver {}", name);

            // Operators, nested paths, sorting
            let older = coll
                .find(&doc(json!({"age": {"$gt": 40}})), FindOptions::sorted_by("age", SortOrder::Descending))
                .await
                .unwrap();
            assert_eq!(older[0]["name"], json!("grace"));
            assert_eq!(older.len(), 2);
            assert!(coll.find_one(&doc(json!({"profile.navy": true}))).await.unwrap().is_some());
            assert!(coll.find_one(&doc(json!({"tags": "math"}))).await.unwrap().is_some());

            // Empty filter updates the first document only
            let result = coll.update_one(&Document::new(), &Update::Set(doc(json!({"flag": 1})))).await.unwrap();
            assert_eq!((result.matched_count, result.modified_count), (1, 1));
            let first = coll.find_one(&doc(json!({"name": "ada"}))).await.unwrap().unwrap();
            assert_eq!(first["flag"], json!(1));
            assert_eq!(coll.count_documents(&doc(json!({"flag": 1})), None).await.unwrap(), 1);

            // Setting the same value again is a match without modification
            let result = coll.update_one(&doc(json!({"name": "ada"})), &Update::Set(doc(json!({"flag": 1})))).await.unwrap();
            assert_eq!((result.matched_count, result.modified_count), (1, 0));

            let result = coll.update_one(&doc(json!({"name": "ada"})), &Update::Unset(vec!["flag".into()])).await.unwrap();
            assert_eq!(result.modified_count, 1);

            let result = coll.update_one(&doc(json!({"name": "nobody"})), &Update::Set(doc(json!({"x": 1})))).await.unwrap();
            assert_eq!(result.matched_count, 0);

            // Count honours the limit
            assert_eq!(coll.count_documents(&Document::new(), Some(1)).await.unwrap(), 1);
            assert_eq!(coll.count_documents(&Document::new(), None).await.unwrap(), 3);

            // Deletes
            assert_eq!(coll.delete_one(&doc(json!({"name": "alan"}))).await.unwrap().deleted_count, 1);
            assert_eq!(coll.delete_one(&doc(json!({"name": "alan"}))).await.unwrap().deleted_count, 0);
            assert_eq!(coll.delete_many(&Document::new()).await.unwrap().deleted_count, 2);
            assert_eq!(coll.count_documents(&Document::new(), None).await.unwrap(), 0);

            // Reads on a collection that was never written are empty, not errors
            let ghost = store.collection("ConformanceDB", "ghost");
            assert!(ghost.find(&Document::new(), FindOptions::default()).await.unwrap().is_empty());
            assert_eq!(ghost.delete_many(&Document::new()).await.unwrap().deleted_count, 0);
        }
    }

    #[tokio::test]
    async fn test_driver_indexes_and_stats() {
        let (_dir, stores) = stores();
        for (name, store) in stores {
            let coll = store.collection("StatsDB", "events");
            let index = coll.create_index(&[("created_at".to_string(), 1)]).await.unwrap();
            assert_eq!(index, "created_at_1");
            // Creating it again is a no-op
            coll.create_index(&[("created_at".to_string(), 1)]).await.unwrap();

            for i in 0..10 {
                coll.insert_one(doc(json!({"i": i, "created_at": "2024-01-01T00:00:00.000Z"}))).await.unwrap();
            }
            store.collection("StatsDB", "other").insert_one(doc(json!({"x": 1}))).await.unwrap();

            let mut collections = store.list_collections("StatsDB").await.unwrap();
            collections.sort();
            assert_eq!(collections, vec!["events".to_string(), "other".to_string()], "driver {}", name);

            let stats = store.collection_stats("StatsDB", "events").await.unwrap();
            assert_eq!(stats.count, 10);
            assert_eq!(stats.nindexes, 2);
            assert!(stats.size > 0);
            assert!(stats.storage_size >= stats.size);

            let db = store.database_stats("StatsDB").await.unwrap();
            assert_eq!(db.collections, 2);
            assert_eq!(db.objects, 11);
            assert_eq!(db.indexes, 3);
            assert_eq!(db.scale_factor, 1);

            let empty = store.database_stats("NoSuchDB").await.unwrap();
            assert_eq!(empty.objects, 0);

            store.close().await.unwrap();
        }
    }
}
