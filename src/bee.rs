//! Key-value view over a log: every mutation is appended as a JSON record
//! and readers fold the log into a map on demand.

use crate::cache::Handle;
use crate::error::Result;
use crate::identifier::KEY_BYTES;
use crate::options::ValueEncoding;
use crate::repo::DataStore;
use crate::resource::Core;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum BeeOp {
    Put,
    Del,
}

#[derive(Debug, Serialize, Deserialize)]
struct BeeRecord {
    op: BeeOp,
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Vec<u8>>,
}

#[derive(Default)]
struct BeeView {
    // how many log entries are folded into the map already
    applied: u64,
    map: BTreeMap<String, Vec<u8>>,
}

pub struct Bee<TStore: DataStore> {
    core: Core<TStore>,
    view: Arc<Mutex<BeeView>>,
    encoding: ValueEncoding,
}

impl<TStore: DataStore> Clone for Bee<TStore> {
    fn clone(&self) -> Self {
        Bee {
            core: self.core.clone(),
            view: self.view.clone(),
            encoding: self.encoding,
        }
    }
}

impl<TStore: DataStore> Bee<TStore> {
    pub(crate) fn new(core: Core<TStore>, encoding: ValueEncoding) -> Bee<TStore> {
        Bee {
            core,
            view: Arc::new(Mutex::new(BeeView::default())),
            encoding,
        }
    }

    pub fn core(&self) -> &Core<TStore> {
        &self.core
    }

    pub fn key(&self) -> [u8; KEY_BYTES] {
        self.core.key()
    }

    pub fn url(&self) -> String {
        self.core.url()
    }

    pub fn writable(&self) -> bool {
        self.core.writable()
    }

    /// Number of log entries behind this view.
    pub fn version(&self) -> u64 {
        self.core.len()
    }

    pub async fn ready(&self) -> Result<()> {
        self.core.ready().await
    }

    pub async fn put(&self, key: &str, value: &[u8]) -> Result<u64> {
        self.encoding.check(value)?;
        let record = BeeRecord {
            op: BeeOp::Put,
            key: key.to_string(),
            value: Some(value.to_vec()),
        };
        self.core.append(&serde_json::to_vec(&record)?).await
    }

    pub async fn del(&self, key: &str) -> Result<u64> {
        let record = BeeRecord {
            op: BeeOp::Del,
            key: key.to_string(),
            value: None,
        };
        self.core.append(&serde_json::to_vec(&record)?).await
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.refresh();
        self.view.lock().unwrap().map.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.refresh();
        self.view.lock().unwrap().map.keys().cloned().collect()
    }

    /// Waits for new entries from the network, then folds them in.
    pub async fn update(&self) -> Result<()> {
        self.core.update().await?;
        self.refresh();
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.core.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    pub fn instance_eq(&self, other: &Bee<TStore>) -> bool {
        self.core.instance_eq(other.core())
    }

    fn refresh(&self) {
        let mut view = self.view.lock().unwrap();
        let len = self.core.len();
        while view.applied < len {
            if let Some(entry) = self.core.get(view.applied) {
                match serde_json::from_slice::<BeeRecord>(&entry) {
                    Ok(record) => match record.op {
                        BeeOp::Put => {
                            view.map
                                .insert(record.key, record.value.unwrap_or_default());
                        }
                        BeeOp::Del => {
                            view.map.remove(&record.key);
                        }
                    },
                    Err(e) => {
                        tracing::debug!("skipping malformed record at {}: {}", view.applied, e);
                    }
                }
            }
            view.applied += 1;
        }
    }
}

impl<TStore: DataStore> Handle for Bee<TStore> {
    fn acquire(&self) -> Self {
        let mut out = self.clone();
        out.core = self.core.acquire();
        out
    }

    fn instance_id(&self) -> u64 {
        self.core.instance_id()
    }

    fn cache_ids(&self) -> (String, Option<String>) {
        self.core.cache_ids()
    }
}

impl<TStore: DataStore> std::fmt::Debug for Bee<TStore> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Bee")
            .field("url", &self.url())
            .field("version", &self.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::MemDataStore;
    use crate::store::Corestore;
    use std::path::PathBuf;

    async fn bee() -> Bee<MemDataStore> {
        let store = Arc::new(MemDataStore::new(PathBuf::new()));
        let cs = Corestore::open(store).await.unwrap();
        let raw = cs.get_by_name("ns", "example", true).await.unwrap();
        Bee::new(Core::new(raw, Some("example".into())), ValueEncoding::Binary)
    }

    #[tokio::test]
    async fn puts_and_deletes_fold_in_order() {
        let bee = bee().await;

        bee.put("greeting", b"hello").await.unwrap();
        bee.put("number", b"42").await.unwrap();
        assert_eq!(bee.get("greeting"), Some(b"hello".to_vec()));

        bee.put("greeting", b"hi").await.unwrap();
        assert_eq!(bee.get("greeting"), Some(b"hi".to_vec()));

        bee.del("greeting").await.unwrap();
        assert_eq!(bee.get("greeting"), None);
        assert_eq!(bee.keys(), vec!["number".to_string()]);
        assert_eq!(bee.version(), 4);
    }

    #[tokio::test]
    async fn encoding_is_validated_on_put() {
        let store = Arc::new(MemDataStore::new(PathBuf::new()));
        let cs = Corestore::open(store).await.unwrap();
        let raw = cs.get_by_name("ns", "json", true).await.unwrap();
        let bee = Bee::new(Core::new(raw, None), ValueEncoding::Json);

        bee.put("ok", br#"{"a":1}"#).await.unwrap();
        assert!(bee.put("bad", b"not json").await.is_err());
    }

    #[tokio::test]
    async fn malformed_records_are_skipped() {
        let bee = bee().await;
        bee.put("keep", b"me").await.unwrap();
        // a raw append bypassing the record format
        bee.core().append(b"garbage").await.unwrap();
        bee.put("more", b"data").await.unwrap();

        assert_eq!(bee.get("keep"), Some(b"me".to_vec()));
        assert_eq!(bee.get("more"), Some(b"data".to_vec()));
    }
}
