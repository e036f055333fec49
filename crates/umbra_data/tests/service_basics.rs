//! Service-level behavior: bindings, identity, references, removal, and
//! modification detection.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use umbra_data::{DataConfig, DataError, DataService, Ref};
use umbra_store::{DataStore, StoreConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Item {
    x: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Label {
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Node {
    value: u32,
    next: Option<Ref<Node>>,
}

fn service(app: &str) -> DataService {
    let store = DataStore::open_in_memory(StoreConfig::default()).unwrap();
    DataService::new(DataConfig::new(app), store).unwrap()
}

#[test]
fn bind_lookup_round_trip() {
    let service = service("basics");

    service
        .run(|| {
            let item = service.create(Item { x: 7 })?;
            service.set_binding("k", &item)?;
            Ok(())
        })
        .unwrap();

    service
        .run(|| {
            let item = service.get_binding::<Item>("k")?;
            assert_eq!(item.read().x, 7);
            Ok(())
        })
        .unwrap();
}

#[test]
fn unbound_name_reports_external_name() {
    let service = service("basics");
    let err = service
        .run(|| service.get_binding::<Item>("missing").map(|_| ()))
        .unwrap_err();
    match err {
        DataError::NameNotBound { name } => assert_eq!(name, "missing"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn identity_preserved_within_transaction() {
    let service = service("basics");

    service
        .run(|| {
            let item = service.create(Item { x: 1 })?;
            service.set_binding("k", &item)?;
            Ok(())
        })
        .unwrap();

    service
        .run(|| {
            let a = service.get_binding::<Item>("k")?;
            let b = service.get_binding::<Item>("k")?;
            assert!(a.same_instance(&b));

            // A reference resolve observes the same instance too.
            let by_ref = a.reference().get()?;
            assert!(a.same_instance(&by_ref));
            Ok(())
        })
        .unwrap();
}

#[test]
fn created_reference_resolves_to_same_instance() {
    let service = service("basics");
    service
        .run(|| {
            let item = service.create(Item { x: 3 })?;
            let reference = service.create_reference(&item)?;
            let resolved = reference.get()?;
            assert!(item.same_instance(&resolved));
            assert_eq!(reference.id(), item.id());
            // Keep the object reachable.
            service.set_binding("k", &item)?;
            Ok(())
        })
        .unwrap();
}

#[test]
fn type_mismatch_detected() {
    let service = service("basics");

    service
        .run(|| {
            let item = service.create(Item { x: 1 })?;
            service.set_binding("k", &item)?;
            Ok(())
        })
        .unwrap();

    let err = service
        .run(|| service.get_binding::<Label>("k").map(|_| ()))
        .unwrap_err();
    assert!(matches!(err, DataError::TypeMismatch { .. }));
}

#[test]
fn enumeration_is_lexicographic_and_complete() {
    let service = service("basics");

    // Bound across three separate transactions, out of order.
    for name in ["b", "a", "c"] {
        service
            .run(|| {
                let item = service.create(Item { x: 0 })?;
                service.set_binding(name, &item)?;
                Ok(())
            })
            .unwrap();
    }

    service
        .run(|| {
            assert_eq!(service.next_bound_name(None)?.unwrap(), "a");
            assert_eq!(service.next_bound_name(Some("a"))?.unwrap(), "b");
            assert_eq!(service.next_bound_name(Some("b"))?.unwrap(), "c");
            assert_eq!(service.next_bound_name(Some("c"))?, None);
            Ok(())
        })
        .unwrap();
}

#[test]
fn enumeration_never_reveals_service_bindings() {
    let service = service("basics");

    service
        .run(|| {
            let item = service.create(Item { x: 0 })?;
            service.set_binding("only", &item)?;
            let mark = service.create(Label {
                text: "internal".to_string(),
            })?;
            service.set_service_binding("internal", &mark)?;
            Ok(())
        })
        .unwrap();

    service
        .run(|| {
            // The application namespace sees exactly its own binding.
            assert_eq!(service.next_bound_name(None)?.unwrap(), "only");
            assert_eq!(service.next_bound_name(Some("only"))?, None);

            // The service namespace contains the header and the internal
            // binding, and never an application name.
            let mut names = Vec::new();
            let mut cursor = service.next_service_bound_name(None)?;
            while let Some(name) = cursor {
                cursor = service.next_service_bound_name(Some(&name))?;
                names.push(name);
            }
            assert!(names.contains(&"internal".to_string()));
            assert!(names.iter().all(|n| n != "only"));
            Ok(())
        })
        .unwrap();
}

#[test]
fn empty_binding_name_is_valid() {
    let service = service("basics");
    service
        .run(|| {
            let item = service.create(Item { x: 9 })?;
            service.set_binding("", &item)?;
            Ok(())
        })
        .unwrap();
    service
        .run(|| {
            assert_eq!(service.get_binding::<Item>("")?.read().x, 9);
            assert_eq!(service.next_bound_name(None)?.unwrap(), "");
            Ok(())
        })
        .unwrap();
}

#[test]
fn removed_object_faults_but_binding_survives() {
    let service = service("basics");

    service
        .run(|| {
            let item = service.create(Item { x: 5 })?;
            service.set_binding("k", &item)?;
            Ok(())
        })
        .unwrap();

    service
        .run(|| {
            let item = service.get_binding::<Item>("k")?;
            let reference = item.reference();
            service.remove_object(&item)?;

            // The name is still bound, but the object is gone.
            assert!(matches!(
                reference.get().unwrap_err(),
                DataError::ObjectNotFound { .. }
            ));
            Ok(())
        })
        .unwrap();

    service
        .run(|| {
            // After commit the binding still exists; resolving it faults.
            let err = service.get_binding::<Item>("k").unwrap_err();
            assert!(matches!(err, DataError::ObjectNotFound { .. }));
            Ok(())
        })
        .unwrap();
}

#[test]
fn remove_binding_leaves_object_alive() {
    let service = service("basics");

    let id = service
        .run(|| {
            let item = service.create(Item { x: 4 })?;
            service.set_binding("k", &item)?;
            Ok(item.id())
        })
        .unwrap();

    service
        .run(|| {
            service.remove_binding("k")?;
            Ok(())
        })
        .unwrap();

    service
        .run(|| {
            assert!(matches!(
                service.get_binding::<Item>("k").unwrap_err(),
                DataError::NameNotBound { .. }
            ));
            // The object is still reachable by ID.
            let reference = service.reference_for_id::<Item>(id)?;
            assert_eq!(reference.get()?.read().x, 4);
            Ok(())
        })
        .unwrap();
}

#[test]
fn reference_for_id_validates_form() {
    let service = service("basics");
    let err = service
        .run(|| service.reference_for_id::<Item>(0).map(|_| ()))
        .unwrap_err();
    assert!(matches!(err, DataError::InvalidId { id: 0 }));
}

#[test]
fn foreign_handle_is_not_managed() {
    let service = service("basics");

    // Handle captured in one transaction, used in a later one.
    let stale = service
        .run(|| {
            let item = service.create(Item { x: 1 })?;
            service.set_binding("k", &item)?;
            Ok(item)
        })
        .unwrap();

    let err = service
        .run(|| service.mark_for_update(&stale))
        .unwrap_err();
    assert!(matches!(err, DataError::ObjectNotManaged));

    let err = service.run(|| service.remove_object(&stale)).unwrap_err();
    assert!(matches!(err, DataError::ObjectNotManaged));
}

#[test]
fn marked_update_persists() {
    let service = service("update");

    service
        .run(|| {
            let item = service.create(Item { x: 10 })?;
            service.set_binding("k", &item)?;
            Ok(())
        })
        .unwrap();

    service
        .run(|| {
            let item = service.get_binding::<Item>("k")?;
            service.mark_for_update(&item)?;
            item.write().x = 20;
            Ok(())
        })
        .unwrap();

    service
        .run(|| {
            assert_eq!(service.get_binding::<Item>("k")?.read().x, 20);
            Ok(())
        })
        .unwrap();
}

#[test]
fn unmarked_modification_detected_and_persisted() {
    let service = service("detect-on");

    service
        .run(|| {
            let item = service.create(Item { x: 1 })?;
            service.set_binding("k", &item)?;
            Ok(())
        })
        .unwrap();

    service
        .run(|| {
            let item = service.get_binding::<Item>("k")?;
            // Mutated without mark_for_update; the detector catches it.
            item.write().x = 2;
            Ok(())
        })
        .unwrap();

    service
        .run(|| {
            assert_eq!(service.get_binding::<Item>("k")?.read().x, 2);
            Ok(())
        })
        .unwrap();
}

#[test]
fn unmarked_modification_lost_when_detection_disabled() {
    let store = DataStore::open_in_memory(StoreConfig::default()).unwrap();
    let service = DataService::new(
        DataConfig::new("detect-off").detect_modifications(false),
        store,
    )
    .unwrap();

    service
        .run(|| {
            let item = service.create(Item { x: 1 })?;
            service.set_binding("k", &item)?;
            Ok(())
        })
        .unwrap();

    service
        .run(|| {
            let item = service.get_binding::<Item>("k")?;
            item.write().x = 2;
            Ok(())
        })
        .unwrap();

    service
        .run(|| {
            assert_eq!(service.get_binding::<Item>("k")?.read().x, 1);
            Ok(())
        })
        .unwrap();
}

#[test]
fn reference_edges_survive_serialization() {
    let service = service("graph");

    service
        .run(|| {
            let tail = service.create(Node {
                value: 2,
                next: None,
            })?;
            let head = service.create(Node {
                value: 1,
                next: Some(tail.reference()),
            })?;
            service.set_binding("head", &head)?;
            Ok(())
        })
        .unwrap();

    service
        .run(|| {
            let head = service.get_binding::<Node>("head")?;
            assert_eq!(head.read().value, 1);
            let next = head.read().next.expect("head links to tail");
            assert_eq!(next.get()?.read().value, 2);
            Ok(())
        })
        .unwrap();
}

#[test]
fn cyclic_graph_resolves_lazily() {
    let service = service("cycle");

    service
        .run(|| {
            let a = service.create(Node {
                value: 1,
                next: None,
            })?;
            let b = service.create(Node {
                value: 2,
                next: Some(a.reference()),
            })?;
            // Close the cycle.
            service.mark_for_update(&a)?;
            a.write().next = Some(b.reference());
            service.set_binding("a", &a)?;
            Ok(())
        })
        .unwrap();

    service
        .run(|| {
            let a = service.get_binding::<Node>("a")?;
            let b_ref = a.read().next.expect("a links to b");
            let b = b_ref.get()?;
            let back = b.read().next.expect("b links back to a");
            let a_again = back.get()?;
            assert!(a.same_instance(&a_again));
            Ok(())
        })
        .unwrap();
}

#[test]
fn dereference_outside_transaction_fails() {
    let service = service("outside");

    let reference = service
        .run(|| {
            let item = service.create(Item { x: 1 })?;
            service.set_binding("k", &item)?;
            Ok(item.reference())
        })
        .unwrap();

    assert!(matches!(
        reference.get().unwrap_err(),
        DataError::TransactionNotActive
    ));
}

#[test]
fn committed_state_visible_across_service_instances() {
    let store: Arc<DataStore> = DataStore::open_in_memory(StoreConfig::default()).unwrap();

    {
        let service = DataService::new(DataConfig::new("shared"), store.clone()).unwrap();
        service
            .run(|| {
                let item = service.create(Item { x: 11 })?;
                service.set_binding("k", &item)?;
                Ok(())
            })
            .unwrap();
    }

    let service = DataService::new(DataConfig::new("shared"), store).unwrap();
    service
        .run(|| {
            assert_eq!(service.get_binding::<Item>("k")?.read().x, 11);
            Ok(())
        })
        .unwrap();
}
