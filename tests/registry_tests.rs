//! Registry semantics: cursor seeding, idempotent detach, epoch fencing,
//! and live sink-set dispatch.

use std::time::Duration;

use manifold::registry::Registry;
use manifold::{Cursor, ManifoldError, Record, RecordId};

fn record(key: &str, timestamp_ms: u64, sequence: u32, payload: &str) -> Record {
    Record {
        key: key.to_string(),
        id: RecordId { timestamp_ms, sequence },
        payload: payload.as_bytes().to_vec().into(),
    }
}

mod features {
    use super::*;

    #[tokio::test]
    async fn test_first_attach_seeds_cursor_later_attaches_join_live() {
        let registry = Registry::new(8);

        let _a1 = registry.attach("k", Cursor::from_millis(100));
        let _a2 = registry.attach("k", Cursor::from_millis(999));

        let active = registry.snapshot_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].cursor, Cursor::from_millis(100));
    }

    #[tokio::test]
    async fn test_detach_is_idempotent_and_reclaims_handle() {
        let registry = Registry::new(8);

        let att = registry.attach("k", Cursor::ZERO);
        registry.detach("k", att.sink_id);
        registry.detach("k", att.sink_id); // no-op

        assert!(registry.snapshot_active().is_empty());
    }

    #[tokio::test]
    async fn test_stale_epoch_cannot_touch_recreated_handle() {
        let registry = Registry::new(8);

        let att = registry.attach("k", Cursor::ZERO);
        let stale = registry.snapshot_active().remove(0);
        registry.detach("k", att.sink_id); // handle destroyed

        let mut fresh = registry.attach("k", Cursor::from_millis(50));
        let current = registry.snapshot_active().remove(0);
        assert_ne!(stale.epoch, current.epoch);

        // Stale advance is dropped.
        registry.advance("k", stale.epoch, Cursor::from_millis(9999));
        assert_eq!(registry.snapshot_active()[0].cursor, Cursor::from_millis(50));

        // Stale fail does not kill the fresh handle.
        registry.fail("k", stale.epoch, ManifoldError::StoreUnavailable("old cycle".into()));
        assert_eq!(registry.snapshot_active().len(), 1);

        // The fresh sink is still served.
        let delivered = registry.dispatch("k", current.epoch, record("k", 60, 0, "still-alive"));
        assert_eq!(delivered, 1);
        let got = fresh.rx.recv().await.unwrap();
        assert_eq!(got.payload, "still-alive");
    }

    #[tokio::test]
    async fn test_dispatch_rereads_live_sink_set() {
        let registry = Registry::new(8);

        let mut a1 = registry.attach("k", Cursor::ZERO);
        let epoch = registry.snapshot_active()[0].epoch;

        // Attached after the snapshot, still included in dispatch.
        let mut a2 = registry.attach("k", Cursor::ZERO);

        let delivered = registry.dispatch("k", epoch, record("k", 1, 0, "x"));
        assert_eq!(delivered, 2);
        assert_eq!(a1.rx.recv().await.unwrap().payload, "x");
        assert_eq!(a2.rx.recv().await.unwrap().payload, "x");
    }

    #[tokio::test]
    async fn test_advance_is_monotonic() {
        let registry = Registry::new(8);

        let _att = registry.attach("k", Cursor::from_millis(100));
        let epoch = registry.snapshot_active()[0].epoch;

        registry.advance("k", epoch, Cursor::from_millis(200));
        registry.advance("k", epoch, Cursor::from_millis(150)); // ignored
        assert_eq!(registry.snapshot_active()[0].cursor, Cursor::from_millis(200));
    }

    #[tokio::test]
    async fn test_fail_clears_handle_and_closes_sinks() {
        let registry = Registry::new(8);

        let mut att = registry.attach("k", Cursor::ZERO);
        let epoch = registry.snapshot_active()[0].epoch;

        registry.fail("k", epoch, ManifoldError::StoreUnavailable("down".into()));
        assert!(registry.snapshot_active().is_empty());
        assert!(att.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_rejects_new_attaches() {
        let registry = Registry::new(8);
        registry.close();

        let mut att = registry.attach("k", Cursor::ZERO);
        let got = tokio::time::timeout(Duration::from_millis(200), att.rx.recv()).await;
        assert!(got.unwrap().is_none(), "terminated attachment must close immediately");
        assert!(registry.snapshot_active().is_empty());
    }
}
