//! File tree view over a log, built on the key-value view with absolute
//! paths as keys.

use crate::bee::Bee;
use crate::cache::Handle;
use crate::error::Result;
use crate::identifier::KEY_BYTES;
use crate::repo::DataStore;
use crate::resource::Core;

fn normalize(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

pub struct Drive<TStore: DataStore> {
    bee: Bee<TStore>,
}

impl<TStore: DataStore> Clone for Drive<TStore> {
    fn clone(&self) -> Self {
        Drive {
            bee: self.bee.clone(),
        }
    }
}

impl<TStore: DataStore> Drive<TStore> {
    pub(crate) fn new(bee: Bee<TStore>) -> Drive<TStore> {
        Drive { bee }
    }

    pub fn core(&self) -> &Core<TStore> {
        self.bee.core()
    }

    pub fn key(&self) -> [u8; KEY_BYTES] {
        self.bee.key()
    }

    pub fn url(&self) -> String {
        self.bee.url()
    }

    pub fn writable(&self) -> bool {
        self.bee.writable()
    }

    pub async fn ready(&self) -> Result<()> {
        self.bee.ready().await
    }

    pub async fn write_file(&self, path: &str, contents: &[u8]) -> Result<u64> {
        self.bee.put(&normalize(path), contents).await
    }

    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        self.bee.get(&normalize(path))
    }

    pub async fn delete_file(&self, path: &str) -> Result<u64> {
        self.bee.del(&normalize(path)).await
    }

    /// All file paths currently present, in lexicographic order.
    pub fn entries(&self) -> Vec<String> {
        self.bee.keys()
    }

    /// Waits for new entries from the network.
    pub async fn update(&self) -> Result<()> {
        self.bee.update().await
    }

    pub async fn close(&self) -> Result<()> {
        self.bee.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.bee.is_closed()
    }

    pub fn instance_eq(&self, other: &Drive<TStore>) -> bool {
        self.bee.instance_eq(&other.bee)
    }
}

impl<TStore: DataStore> Handle for Drive<TStore> {
    fn acquire(&self) -> Self {
        Drive {
            bee: self.bee.acquire(),
        }
    }

    fn instance_id(&self) -> u64 {
        self.bee.instance_id()
    }

    fn cache_ids(&self) -> (String, Option<String>) {
        self.bee.cache_ids()
    }
}

impl<TStore: DataStore> std::fmt::Debug for Drive<TStore> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Drive").field("url", &self.url()).finish()
    }
}
