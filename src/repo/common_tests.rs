//! "Interface" tests shared by every `DataStore` implementation.

use crate::repo::DataStore;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub struct DSTestContext<T> {
    #[allow(dead_code)]
    tempdir: TempDir,
    datastore: Arc<T>,
}

impl<T: DataStore> DSTestContext<T> {
    /// Creates the store inside a temporary directory which is deleted on
    /// drop.
    pub async fn with<F>(factory: F) -> Self
    where
        F: FnOnce(PathBuf) -> T,
    {
        let tempdir = TempDir::new().expect("tempdir creation failed");
        let ds = factory(tempdir.path().to_owned());
        ds.init().await.unwrap();
        DSTestContext {
            tempdir,
            datastore: Arc::new(ds),
        }
    }
}

impl<T: DataStore> std::ops::Deref for DSTestContext<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &*self.datastore
    }
}

/// Generates the common interface tests for a `DataStore` implementation as
/// a module, given a factory method. When adding tests it is easier to write
/// them against one implementation first and move them here afterwards.
#[macro_export]
macro_rules! datastore_interface_tests {
    ($module_name:ident, $factory:expr) => {
        #[cfg(test)]
        mod $module_name {
            use crate::repo::common_tests::DSTestContext;
            use crate::repo::{Column, DataStore};

            #[tokio::test]
            async fn put_get_remove_roundtrip() {
                let store = DSTestContext::with($factory).await;

                assert_eq!(store.get(Column::Dns, b"example.com").await.unwrap(), None);
                assert!(!store.contains(Column::Dns, b"example.com").await.unwrap());

                store
                    .put(Column::Dns, b"example.com", b"answer")
                    .await
                    .unwrap();
                assert!(store.contains(Column::Dns, b"example.com").await.unwrap());
                assert_eq!(
                    store.get(Column::Dns, b"example.com").await.unwrap(),
                    Some(b"answer".to_vec())
                );

                // overwrite is silent
                store
                    .put(Column::Dns, b"example.com", b"other")
                    .await
                    .unwrap();
                assert_eq!(
                    store.get(Column::Dns, b"example.com").await.unwrap(),
                    Some(b"other".to_vec())
                );

                store.remove(Column::Dns, b"example.com").await.unwrap();
                assert_eq!(store.get(Column::Dns, b"example.com").await.unwrap(), None);

                // removing a missing key is not an error
                store.remove(Column::Dns, b"example.com").await.unwrap();
            }

            #[tokio::test]
            async fn columns_are_disjoint() {
                let store = DSTestContext::with($factory).await;

                store.put(Column::Dns, b"shared", b"dns").await.unwrap();
                store.put(Column::Core, b"shared", b"core").await.unwrap();

                assert_eq!(
                    store.get(Column::Dns, b"shared").await.unwrap(),
                    Some(b"dns".to_vec())
                );
                assert_eq!(
                    store.get(Column::Core, b"shared").await.unwrap(),
                    Some(b"core".to_vec())
                );

                store.remove(Column::Dns, b"shared").await.unwrap();
                assert_eq!(
                    store.get(Column::Core, b"shared").await.unwrap(),
                    Some(b"core".to_vec())
                );
            }

            #[tokio::test]
            async fn list_is_prefix_filtered_and_ordered() {
                let store = DSTestContext::with($factory).await;

                store.put(Column::Core, b"log.a.02", b"2").await.unwrap();
                store.put(Column::Core, b"log.a.00", b"0").await.unwrap();
                store.put(Column::Core, b"log.b.00", b"x").await.unwrap();
                store.put(Column::Core, b"log.a.01", b"1").await.unwrap();

                let listed = store.list(Column::Core, b"log.a.").await.unwrap();
                let keys = listed
                    .iter()
                    .map(|(k, _)| String::from_utf8_lossy(k).into_owned())
                    .collect::<Vec<_>>();
                assert_eq!(keys, vec!["log.a.00", "log.a.01", "log.a.02"]);
                let values = listed.iter().map(|(_, v)| v.clone()).collect::<Vec<_>>();
                assert_eq!(values, vec![b"0".to_vec(), b"1".to_vec(), b"2".to_vec()]);
            }
        }
    };
}
