//! Type-independent binary item storage.
//!
//! Items live under `<root>/R/<item_type>/<id_tuple>`; the `R` element is
//! kept for compatibility with pre-existing data. This store never touches
//! index keys — callers combine it with the index manager.

use async_stream::try_stream;
use futures_core::Stream;

use crate::errors::StorageError;
use crate::kv::{KeySelector, KvTransaction, RangeOptions};
use crate::subspace::Subspace;
use crate::tuple::Tuple;

/// Upper bound on a packed item id.
const MAX_ID_BYTES: usize = 4096;

/// Page size for range scans.
const SCAN_BATCH: usize = 256;

#[derive(Debug, Clone)]
pub struct ItemStore {
    items: Subspace,
}

impl ItemStore {
    pub fn new(root: &Subspace) -> Self {
        ItemStore {
            items: root.subspace("R"),
        }
    }

    pub fn type_subspace(&self, item_type: &str) -> Subspace {
        self.items.subspace(item_type)
    }

    pub fn validate_id(id: &Tuple) -> Result<(), StorageError> {
        if id.is_empty() {
            return Err(StorageError::IdValidation("id tuple is empty".into()));
        }
        if id.has_incomplete_versionstamp() {
            return Err(StorageError::IdValidation(
                "id contains an incomplete versionstamp".into(),
            ));
        }
        if id.pack().len() > MAX_ID_BYTES {
            return Err(StorageError::IdValidation(format!(
                "packed id exceeds {MAX_ID_BYTES} bytes"
            )));
        }
        Ok(())
    }

    fn item_key(&self, item_type: &str, id: &Tuple) -> Result<Vec<u8>, StorageError> {
        Self::validate_id(id)?;
        Ok(self.type_subspace(item_type).pack(id))
    }

    /// Overwrites the item bytes.
    pub async fn save<T: KvTransaction>(
        &self,
        tx: &T,
        item_type: &str,
        id: &Tuple,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        let key = self.item_key(item_type, id)?;
        tx.set(&key, bytes);
        Ok(())
    }

    pub async fn load<T: KvTransaction>(
        &self,
        tx: &T,
        item_type: &str,
        id: &Tuple,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let key = self.item_key(item_type, id)?;
        Ok(tx.get(&key).await?)
    }

    /// Like [`load`](Self::load) but absent items are an error.
    pub async fn load_required<T: KvTransaction>(
        &self,
        tx: &T,
        item_type: &str,
        id: &Tuple,
    ) -> Result<Vec<u8>, StorageError> {
        self.load(tx, item_type, id)
            .await?
            .ok_or_else(|| StorageError::KeyNotFound {
                item_type: item_type.to_string(),
                id: hex::encode(id.pack()),
            })
    }

    /// Clears a single item key; absent ids are a no-op.
    pub async fn delete<T: KvTransaction>(
        &self,
        tx: &T,
        item_type: &str,
        id: &Tuple,
    ) -> Result<(), StorageError> {
        let key = self.item_key(item_type, id)?;
        tx.clear(&key);
        Ok(())
    }

    /// Range-clears every item of the given type.
    pub fn clear<T: KvTransaction>(&self, tx: &T, item_type: &str) {
        let (begin, end) = self.type_subspace(item_type).range();
        tx.clear_range(&begin, &end);
    }

    /// Streams `(id, bytes)` pairs in key order over a right-open range scan,
    /// fetching pages of [`SCAN_BATCH`] under the caller's transaction.
    pub fn scan<'a, T: KvTransaction>(
        &self,
        tx: &'a T,
        item_type: &str,
    ) -> impl Stream<Item = Result<(Tuple, Vec<u8>), StorageError>> + 'a {
        let subspace = self.type_subspace(item_type);
        try_stream! {
            let (begin, end) = subspace.range();
            let mut cursor = KeySelector::first_greater_or_equal(begin);
            loop {
                let page = tx
                    .get_range(
                        cursor.clone(),
                        KeySelector::first_greater_or_equal(end.clone()),
                        RangeOptions::limited(SCAN_BATCH),
                    )
                    .await
                    .map_err(StorageError::from)?;
                let full_page = page.len() == SCAN_BATCH;
                let last_key = page.last().map(|kv| kv.key.clone());
                for kv in page {
                    let id = subspace.unpack(&kv.key).map_err(StorageError::from)?;
                    yield (id, kv.value);
                }
                match (full_page, last_key) {
                    (true, Some(last)) => {
                        cursor = KeySelector::first_greater_than(last);
                    }
                    _ => break,
                }
            }
        }
    }
}
