//! Version index maintenance.
//!
//! Entry layout: `<idx_subspace>/<group_tuple>/<versionstamp>/<id_tuple>`
//! with an empty value, where the versionstamp is substituted by the store at
//! commit time. Entries answer "changed since" queries in commit order.
//!
//! Because the stamp of a committed entry is not derivable from the record,
//! the maintainer keeps a per-item sidecar at `<root>/V/<item_type>/<id>`
//! holding the item's latest stamp. Updates and deletes consult it to clear
//! the prior entry; version indexes covering the same type share the cell.

use tracing::trace;

use crate::errors::IndexError;
use crate::expr::KeyExpression;
use crate::kv::{KeySelector, KvTransaction, RangeOptions};
use crate::record::RecordValue;
use crate::subspace::Subspace;
use crate::tuple::{Element, Tuple, Versionstamp, VERSIONSTAMP_SIZE};

/// One decoded version index entry.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionEntry {
    pub group: Tuple,
    pub stamp: Versionstamp,
    pub id: Tuple,
}

#[derive(Debug, Clone)]
pub struct VersionMaintainer {
    name: String,
    expr: KeyExpression,
    subspace: Subspace,
    versions: Subspace,
}

impl VersionMaintainer {
    pub fn new(
        name: String,
        expr: KeyExpression,
        subspace: Subspace,
        versions: Subspace,
    ) -> Self {
        VersionMaintainer {
            name,
            expr,
            subspace,
            versions,
        }
    }

    pub fn subspace(&self) -> &Subspace {
        &self.subspace
    }

    fn sidecar_key(&self, item_type: &str, id: &Tuple) -> Vec<u8> {
        let mut tuple = Tuple::new().with(item_type);
        tuple.append(id.clone());
        self.versions.pack(&tuple)
    }

    async fn stored_stamp<T: KvTransaction>(
        &self,
        tx: &T,
        item_type: &str,
        id: &Tuple,
    ) -> Result<Option<Versionstamp>, IndexError> {
        let raw = tx.get(&self.sidecar_key(item_type, id)).await?;
        Ok(raw.and_then(|bytes| {
            let bytes: [u8; VERSIONSTAMP_SIZE] = bytes.as_slice().try_into().ok()?;
            Some(Versionstamp::from_bytes(bytes))
        }))
    }

    fn clear_entries<T: KvTransaction>(
        &self,
        tx: &T,
        record: &RecordValue,
        id: &Tuple,
        stamp: Versionstamp,
    ) -> Result<(), IndexError> {
        for row in self.expr.eval(record).map_err(IndexError::from)? {
            let mut entry = row;
            entry.push(Element::Versionstamp(stamp));
            entry.append(id.clone());
            tx.clear(&self.subspace.pack(&entry));
        }
        Ok(())
    }

    fn write_entries<T: KvTransaction>(
        &self,
        tx: &T,
        record: &RecordValue,
        item_type: &str,
        id: &Tuple,
    ) -> Result<(), IndexError> {
        for row in self.expr.eval(record).map_err(IndexError::from)? {
            let mut entry = row;
            entry.push(Element::Versionstamp(Versionstamp::incomplete()));
            entry.append(id.clone());
            let key = self.subspace.pack_with_versionstamp(&entry)?;
            tx.set_versionstamped_key(key, &[]);
        }
        tx.set_versionstamped_value(
            &self.sidecar_key(item_type, id),
            vec![0; VERSIONSTAMP_SIZE],
            0,
        );
        Ok(())
    }

    pub async fn update<T: KvTransaction>(
        &self,
        tx: &T,
        item_type: &str,
        id: &Tuple,
        old: Option<&RecordValue>,
        new: Option<&RecordValue>,
    ) -> Result<(), IndexError> {
        if let Some(old) = old {
            if let Some(stamp) = self.stored_stamp(tx, item_type, id).await? {
                self.clear_entries(tx, old, id, stamp)?;
            }
        }
        match new {
            Some(new) => self.write_entries(tx, new, item_type, id)?,
            None => tx.clear(&self.sidecar_key(item_type, id)),
        }
        trace!(index = %self.name, "version entries updated");
        Ok(())
    }

    /// Online-build application. An item that already carries a sidecar
    /// stamp (stamped by a concurrent writer, or surviving a rebuild) gets
    /// its entries re-derived from that stamp, which makes re-scans
    /// idempotent: the derived keys are identical on every pass.
    pub async fn scan_item<T: KvTransaction>(
        &self,
        tx: &T,
        item_type: &str,
        id: &Tuple,
        record: &RecordValue,
    ) -> Result<(), IndexError> {
        match self.stored_stamp(tx, item_type, id).await? {
            Some(stamp) => {
                for row in self.expr.eval(record).map_err(IndexError::from)? {
                    let mut entry = row;
                    entry.push(Element::Versionstamp(stamp));
                    entry.append(id.clone());
                    tx.set(&self.subspace.pack(&entry), &[]);
                }
                Ok(())
            }
            None => self.write_entries(tx, record, item_type, id),
        }
    }

    /// Entries of one group with a stamp strictly greater than `since`, in
    /// commit order.
    pub async fn changed_since<T: KvTransaction>(
        &self,
        tx: &T,
        group: &Tuple,
        since: Option<Versionstamp>,
        options: RangeOptions,
    ) -> Result<Vec<VersionEntry>, IndexError> {
        let (begin, end) = self.subspace.range_of(group);
        let begin = match since {
            Some(stamp) => {
                let mut anchor = group.clone();
                anchor.push(Element::Versionstamp(stamp));
                // Skip every id under the anchor stamp itself.
                crate::tuple::next_prefix(&self.subspace.pack(&anchor))
            }
            None => begin,
        };
        let pairs = tx
            .get_range(
                KeySelector::first_greater_or_equal(begin),
                KeySelector::first_greater_or_equal(end),
                options,
            )
            .await?;
        let group_len = group.len();
        let mut entries = Vec::with_capacity(pairs.len());
        for kv in pairs {
            let tuple = self.subspace.unpack(&kv.key)?;
            let elements = tuple.into_elements();
            if elements.len() < group_len + 2 {
                continue;
            }
            let stamp = match &elements[group_len] {
                Element::Versionstamp(v) => *v,
                _ => continue,
            };
            entries.push(VersionEntry {
                group: Tuple::from_elements(elements[..group_len].to_vec()),
                stamp,
                id: Tuple::from_elements(elements[group_len + 1..].to_vec()),
            });
        }
        Ok(entries)
    }

    /// Group-prefix keys plus the sidecar cell; committed stamps are not
    /// derivable from the record, so full entry keys are not reported.
    pub fn compute_index_keys(
        &self,
        item_type: &str,
        id: &Tuple,
        record: &RecordValue,
    ) -> Result<Vec<Vec<u8>>, IndexError> {
        let mut keys = vec![self.sidecar_key(item_type, id)];
        for row in self.expr.eval(record).map_err(IndexError::from)? {
            keys.push(self.subspace.pack(&row));
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
