//! Behaviour of the table façade: round-trip laws, boundary cases and the
//! generation-advancing resize, exercised through the public API and the
//! wire-level object names.

use std::path::Path;

use ipc_kv::{Error, IpcKv, DATA_SIZE, KEY_SIZE};

fn table(tag: &str) -> String {
    format!("t{}_{}", std::process::id(), tag)
}

fn data_segment_exists(generation: usize, table: &str) -> bool {
    Path::new("/dev/shm")
        .join(format!("ipckv_{}_{}", generation, table))
        .exists()
}

#[test]
fn insert_lookup_remove_clear() {
    let name = table("basic");
    let mut kv = IpcKv::open(&name).unwrap();

    kv.set("How are you?", &[0x68, 0x69]).unwrap();
    kv.set("Hello World", &[0x68, 0x69]).unwrap();
    assert_eq!(kv.size().unwrap(), 2);

    assert!(kv.remove("Hello World").unwrap());
    assert_eq!(kv.size().unwrap(), 1);
    assert!(!kv.remove("Hello World").unwrap());

    kv.clear().unwrap();
    assert_eq!(kv.size().unwrap(), 0);

    kv.destroy().unwrap();
}

#[test]
fn lookup_crosses_tombstones() {
    let name = table("tombstone");
    let mut kv = IpcKv::open(&name).unwrap();

    for key in &["ABC", "EFG", "XYZ"] {
        kv.set(key, &[0x68, 0x69]).unwrap();
    }
    assert!(kv.remove("ABC").unwrap());

    let value = kv.get("EFG").unwrap().expect("EFG must survive the remove");
    assert_eq!(value, vec![0x68, 0x69]);
    assert_eq!(kv.get("ABC").unwrap(), None);
    assert_eq!(kv.get("never inserted").unwrap(), None);

    kv.destroy().unwrap();
}

#[test]
fn last_write_wins() {
    let name = table("rewrite");
    let mut kv = IpcKv::open(&name).unwrap();

    kv.set("key", b"first").unwrap();
    kv.set("key", b"second, longer value").unwrap();
    assert_eq!(kv.get("key").unwrap().unwrap(), b"second, longer value");
    // Rewriting must not grow the table.
    assert_eq!(kv.size().unwrap(), 1);

    kv.set("key", b"").unwrap();
    assert_eq!(kv.get("key").unwrap().unwrap(), b"");
    assert_eq!(kv.size().unwrap(), 1);

    kv.destroy().unwrap();
}

#[test]
fn length_limits() {
    let name = table("limits");
    let mut kv = IpcKv::open(&name).unwrap();

    let huge_value = vec![0u8; DATA_SIZE];
    assert!(matches!(
        kv.set("k", &huge_value),
        Err(Error::ValueTooLong(_))
    ));
    kv.set("k", &huge_value[..DATA_SIZE - 1]).unwrap();
    assert_eq!(kv.get("k").unwrap().unwrap().len(), DATA_SIZE - 1);

    let long_key = "k".repeat(KEY_SIZE - 1);
    assert!(matches!(
        kv.set(&long_key, b"v"),
        Err(Error::KeyTooLong(_))
    ));
    let ok_key = "k".repeat(KEY_SIZE - 2);
    kv.set(&ok_key, b"v").unwrap();
    assert_eq!(kv.get(&ok_key).unwrap().unwrap(), b"v");

    // The failed calls must not have changed the table.
    assert_eq!(kv.size().unwrap(), 2);

    kv.destroy().unwrap();
}

#[test]
fn seventh_insert_advances_the_generation() {
    let name = table("resize");
    let mut kv = IpcKv::open(&name).unwrap();
    assert!(data_segment_exists(0, &name));

    for i in 0..6 {
        kv.set(&format!("key-{}", i), b"payload").unwrap();
    }
    assert!(!data_segment_exists(1, &name));

    // At 6/10 the load factor hits the bound; the next set grows first.
    kv.set("key-6", b"payload").unwrap();
    assert!(data_segment_exists(1, &name));
    assert!(!data_segment_exists(0, &name), "old generation must be abandoned");

    assert_eq!(kv.size().unwrap(), 7);
    for i in 0..7 {
        let value = kv.get(&format!("key-{}", i)).unwrap();
        assert_eq!(value.unwrap(), b"payload");
    }

    kv.destroy().unwrap();
}

#[test]
fn stale_handle_remaps_after_resize() {
    let name = table("stale");
    let mut writer = IpcKv::open(&name).unwrap();
    // Second handle attaches at generation 0 and goes idle.
    let mut observer = IpcKv::open(&name).unwrap();

    for i in 0..7 {
        writer.set(&format!("key-{}", i), b"shared").unwrap();
    }
    assert!(data_segment_exists(1, &name));

    // The observer's next call must notice the moved generation and
    // lazily re-map the new segment.
    assert_eq!(observer.size().unwrap(), 7);
    for i in 0..7 {
        assert_eq!(observer.get(&format!("key-{}", i)).unwrap().unwrap(), b"shared");
    }

    drop(writer);
    observer.destroy().unwrap();
}

#[test]
fn values_survive_handle_reopen() {
    let name = table("reopen");

    let mut kv = IpcKv::open(&name).unwrap();
    kv.set("durable", b"bytes").unwrap();
    drop(kv);

    let mut kv = IpcKv::open(&name).unwrap();
    assert_eq!(kv.get("durable").unwrap().unwrap(), b"bytes");
    kv.destroy().unwrap();
}

#[test]
fn clear_of_large_table() {
    let name = table("bulk");
    let mut kv = IpcKv::open(&name).unwrap();

    for i in 0..1000 {
        kv.set(&format!("bulk-key-{}", i), format!("value-{}", i).as_bytes())
            .unwrap();
    }
    assert_eq!(kv.size().unwrap(), 1000);
    for i in (0..1000).step_by(97) {
        let value = kv.get(&format!("bulk-key-{}", i)).unwrap().unwrap();
        assert_eq!(value, format!("value-{}", i).as_bytes());
    }

    kv.clear().unwrap();
    assert_eq!(kv.size().unwrap(), 0);
    for i in (0..1000).step_by(97) {
        assert_eq!(kv.get(&format!("bulk-key-{}", i)).unwrap(), None);
    }

    kv.destroy().unwrap();
}

#[test]
fn table_names_are_validated() {
    assert!(matches!(IpcKv::open(""), Err(Error::InvalidName(_))));
    assert!(matches!(IpcKv::open("no/slashes"), Err(Error::InvalidName(_))));
    assert!(matches!(IpcKv::open(".hidden"), Err(Error::InvalidName(_))));

    let long = "x".repeat(300);
    assert!(matches!(IpcKv::open(&long), Err(Error::NameTooLong(_))));
}
