//! Directory layer and item store over the in-memory backend.

use futures_util::StreamExt;
use manifold_core::directory::DirectoryLayer;
use manifold_core::errors::{DirectoryError, RuntimeError, StorageError};
use manifold_core::item::ItemStore;
use manifold_core::kv::{with_transaction, KvDatabase, KvTransaction, RetryConfig};
use manifold_core::subspace::Subspace;
use manifold_core::tuple::Tuple;
use manifold_memkv::MemKv;

async fn in_tx<T, F, Fut>(db: &MemKv, body: F) -> T
where
    T: Send,
    F: Fn(std::sync::Arc<manifold_memkv::MemTransaction>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<T, RuntimeError>> + Send,
{
    with_transaction(db, &RetryConfig::default(), body)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_directory_create_open_exists() {
    manifold_testing::setup_tracing();
    let db = MemKv::new();
    let layer = DirectoryLayer::new();

    let created = in_tx(&db, |tx| {
        let layer = layer.clone();
        async move {
            let sub = layer.create(tx.as_ref(), &["app", "main"]).await?;
            Ok(sub)
        }
    })
    .await;

    let reopened = in_tx(&db, |tx| {
        let layer = layer.clone();
        async move {
            assert!(layer.exists(tx.as_ref(), &["app", "main"]).await?);
            let sub = layer.open(tx.as_ref(), &["app", "main"]).await?;
            Ok(sub)
        }
    })
    .await;
    assert_eq!(created, reopened);
}

#[tokio::test]
async fn test_directory_prefixes_never_collide() {
    let db = MemKv::new();
    let layer = DirectoryLayer::new();

    let prefixes = in_tx(&db, |tx| {
        let layer = layer.clone();
        async move {
            let mut prefixes = Vec::new();
            for name in ["a", "b", "c", "d"] {
                let sub = layer.create(tx.as_ref(), &["tenants", name]).await?;
                prefixes.push(sub.prefix().to_vec());
            }
            Ok(prefixes)
        }
    })
    .await;

    for (i, a) in prefixes.iter().enumerate() {
        for (j, b) in prefixes.iter().enumerate() {
            if i != j {
                assert_ne!(a, b);
                assert!(!a.starts_with(b.as_slice()) && !b.starts_with(a.as_slice()));
            }
        }
    }
}

#[tokio::test]
async fn test_directory_duplicate_create_fails() {
    let db = MemKv::new();
    let layer = DirectoryLayer::new();
    let err = in_tx(&db, |tx| {
        let layer = layer.clone();
        async move {
            layer.create(tx.as_ref(), &["dup"]).await?;
            Ok(layer.create(tx.as_ref(), &["dup"]).await)
        }
    })
    .await;
    assert!(matches!(err, Err(DirectoryError::AlreadyExists(_))));
}

#[tokio::test]
async fn test_directory_open_missing_fails() {
    let db = MemKv::new();
    let layer = DirectoryLayer::new();
    let err = in_tx(&db, |tx| {
        let layer = layer.clone();
        async move { Ok(layer.open(tx.as_ref(), &["nope"]).await) }
    })
    .await;
    assert!(matches!(err, Err(DirectoryError::NotFound(_))));
}

#[tokio::test]
async fn test_directory_invalid_paths() {
    let db = MemKv::new();
    let layer = DirectoryLayer::new();
    let (empty, blank) = in_tx(&db, |tx| {
        let layer = layer.clone();
        async move {
            Ok((
                layer.create(tx.as_ref(), &[]).await,
                layer.create(tx.as_ref(), &["a", ""]).await,
            ))
        }
    })
    .await;
    assert!(matches!(empty, Err(DirectoryError::PathInvalid(_))));
    assert!(matches!(blank, Err(DirectoryError::PathInvalid(_))));
}

#[tokio::test]
async fn test_directory_move_keeps_data() {
    let db = MemKv::new();
    let layer = DirectoryLayer::new();

    let before = in_tx(&db, |tx| {
        let layer = layer.clone();
        async move {
            let sub = layer.create(tx.as_ref(), &["old", "spot"]).await?;
            tx.set(&sub.pack(&Tuple::new().with("k")), b"v");
            Ok(sub)
        }
    })
    .await;

    let after = in_tx(&db, |tx| {
        let layer = layer.clone();
        async move {
            layer
                .move_to(tx.as_ref(), &["old", "spot"], &["new", "spot"])
                .await?;
            Ok(layer.open(tx.as_ref(), &["new", "spot"]).await?)
        }
    })
    .await;
    assert_eq!(before, after, "the allocated prefix travels with the path");

    let value = in_tx(&db, |tx| {
        let after = after.clone();
        let layer = layer.clone();
        async move {
            assert!(!layer.exists(tx.as_ref(), &["old", "spot"]).await?);
            Ok(tx
                .get(&after.pack(&Tuple::new().with("k")))
                .await
                .map_err(RuntimeError::Kv)?)
        }
    })
    .await;
    assert_eq!(value, Some(b"v".to_vec()));
}

#[tokio::test]
async fn test_directory_remove_clears_data_and_children() {
    let db = MemKv::new();
    let layer = DirectoryLayer::new();

    in_tx(&db, |tx| {
        let layer = layer.clone();
        async move {
            let parent = layer.create(tx.as_ref(), &["zone"]).await?;
            let child = layer.create(tx.as_ref(), &["zone", "inner"]).await?;
            tx.set(&parent.pack(&Tuple::new().with("p")), b"1");
            tx.set(&child.pack(&Tuple::new().with("c")), b"2");
            Ok(())
        }
    })
    .await;

    in_tx(&db, |tx| {
        let layer = layer.clone();
        async move {
            layer.remove(tx.as_ref(), &["zone"]).await?;
            Ok(())
        }
    })
    .await;

    let gone = in_tx(&db, |tx| {
        let layer = layer.clone();
        async move {
            Ok((
                layer.exists(tx.as_ref(), &["zone"]).await?,
                layer.exists(tx.as_ref(), &["zone", "inner"]).await?,
            ))
        }
    })
    .await;
    assert_eq!(gone, (false, false));
    assert_eq!(db.key_count(), 1, "only the allocation counter remains");
}

#[tokio::test]
async fn test_directory_list_children() {
    let db = MemKv::new();
    let layer = DirectoryLayer::new();
    let children = in_tx(&db, |tx| {
        let layer = layer.clone();
        async move {
            layer.create(tx.as_ref(), &["root"]).await?;
            layer.create(tx.as_ref(), &["root", "b"]).await?;
            layer.create(tx.as_ref(), &["root", "a"]).await?;
            layer.create(tx.as_ref(), &["root", "a", "deep"]).await?;
            Ok(layer.list(tx.as_ref(), &["root"]).await?)
        }
    })
    .await;
    assert_eq!(children, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn test_item_store_crud_and_scan() {
    let db = MemKv::new();
    let store = ItemStore::new(&Subspace::new(vec![0x15, 0x2a]));

    in_tx(&db, |tx| {
        let store = store.clone();
        async move {
            store
                .save(tx.as_ref(), "User", &Tuple::new().with("u2"), b"two")
                .await?;
            store
                .save(tx.as_ref(), "User", &Tuple::new().with("u1"), b"one")
                .await?;
            store
                .save(tx.as_ref(), "Order", &Tuple::new().with("o1"), b"other")
                .await?;
            Ok(())
        }
    })
    .await;

    // Overwrite replaces bytes under the same id.
    in_tx(&db, |tx| {
        let store = store.clone();
        async move {
            store
                .save(tx.as_ref(), "User", &Tuple::new().with("u1"), b"ONE")
                .await?;
            Ok(())
        }
    })
    .await;

    let scanned = in_tx(&db, |tx| {
        let store = store.clone();
        async move {
            let stream = store.scan(tx.as_ref(), "User");
            futures_util::pin_mut!(stream);
            let mut out = Vec::new();
            while let Some(next) = stream.next().await {
                let (id, bytes) = next?;
                out.push((id, bytes));
            }
            Ok(out)
        }
    })
    .await;
    assert_eq!(
        scanned,
        vec![
            (Tuple::new().with("u1"), b"ONE".to_vec()),
            (Tuple::new().with("u2"), b"two".to_vec()),
        ],
        "scan is id-ordered and per-type"
    );

    in_tx(&db, |tx| {
        let store = store.clone();
        async move {
            store
                .delete(tx.as_ref(), "User", &Tuple::new().with("u1"))
                .await?;
            Ok(())
        }
    })
    .await;
    let loaded = in_tx(&db, |tx| {
        let store = store.clone();
        async move {
            Ok((
                store.load(tx.as_ref(), "User", &Tuple::new().with("u1")).await?,
                store.load(tx.as_ref(), "User", &Tuple::new().with("u2")).await?,
            ))
        }
    })
    .await;
    assert_eq!(loaded, (None, Some(b"two".to_vec())));

    // Range-clear wipes the type but leaves others alone.
    let remaining = in_tx(&db, |tx| {
        let store = store.clone();
        async move {
            store.clear(tx.as_ref(), "User");
            Ok((
                store.load(tx.as_ref(), "User", &Tuple::new().with("u2")).await?,
                store.load(tx.as_ref(), "Order", &Tuple::new().with("o1")).await?,
            ))
        }
    })
    .await;
    assert_eq!(remaining, (None, Some(b"other".to_vec())));
}

#[tokio::test]
async fn test_item_id_validation() {
    let db = MemKv::new();
    let store = ItemStore::new(&Subspace::new(vec![0x15, 0x2a]));
    let result = in_tx(&db, |tx| {
        let store = store.clone();
        async move {
            Ok(store.save(tx.as_ref(), "User", &Tuple::new(), b"x").await)
        }
    })
    .await;
    assert!(matches!(result, Err(StorageError::IdValidation(_))));

    let tx = db.begin().await.unwrap();
    let huge = Tuple::new().with(vec![0u8; 8192]);
    assert!(matches!(
        store.load(&tx, "User", &huge).await,
        Err(StorageError::IdValidation(_))
    ));
}
