//! Concurrent access through independent handles. Threads stand in for
//! processes here; every handle maps the segments and acquires the named
//! locks exactly the way a separate process would.

use std::thread;
use std::time::{Duration, Instant};

use ipc_kv::{layout, IpcKv, IpcLock, LockMode};

fn table(tag: &str) -> String {
    format!("c{}_{}", std::process::id(), tag)
}

#[test]
fn writer_blocks_reader_until_released() {
    let name = table("exclusion");
    let mut kv = IpcKv::open(&name).unwrap();
    kv.set("watched", b"before").unwrap();

    // Hold the generation-0 write lock the way a writing process would.
    let lock_name = layout::rw_lock_name(0, &name).unwrap();
    let held = IpcLock::acquire(LockMode::Write, &lock_name).unwrap();

    let reader_name = name.clone();
    let reader = thread::spawn(move || {
        let mut kv = IpcKv::open(&reader_name).unwrap();
        let start = Instant::now();
        let value = kv.get("watched").unwrap();
        (start.elapsed(), value)
    });

    thread::sleep(Duration::from_millis(300));
    drop(held);

    let (blocked_for, value) = reader.join().unwrap();
    assert!(blocked_for >= Duration::from_millis(150));
    assert_eq!(value.unwrap(), b"before");

    kv.destroy().unwrap();
}

#[test]
fn distinct_keys_from_parallel_writers() {
    let name = table("fanin");
    let mut kv = IpcKv::open(&name).unwrap();

    // Grow the table past the next load-factor boundary up front, so the
    // parallel phase below runs on a single generation.
    for i in 0..30 {
        kv.set(&format!("seed-{}", i), b"seed").unwrap();
    }

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let name = name.clone();
            thread::spawn(move || {
                let mut kv = IpcKv::open(&name).unwrap();
                for i in 0..6 {
                    let key = format!("worker-{}-{}", worker, i);
                    kv.set(&key, key.as_bytes()).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(kv.size().unwrap(), 30 + 4 * 6);
    for worker in 0..4 {
        for i in 0..6 {
            let key = format!("worker-{}-{}", worker, i);
            assert_eq!(kv.get(&key).unwrap().unwrap(), key.as_bytes());
        }
    }

    kv.destroy().unwrap();
}

#[test]
fn rewrites_are_never_torn() {
    let name = table("torn");
    let mut kv = IpcKv::open(&name).unwrap();

    let keys: Vec<String> = (0..8).map(|i| format!("cell-{}", i)).collect();
    for key in &keys {
        kv.set(key, &[b'A'; 100]).unwrap();
    }

    // Rewrites alternate between two self-describing patterns of
    // different lengths; a reader must only ever see one of them whole.
    let writers: Vec<_> = (0..3)
        .map(|worker| {
            let name = name.clone();
            let keys = keys.clone();
            thread::spawn(move || {
                let mut kv = IpcKv::open(&name).unwrap();
                for round in 0..40 {
                    let key = &keys[(worker + round) % keys.len()];
                    if round % 2 == 0 {
                        kv.set(key, &[b'B'; 200]).unwrap();
                    } else {
                        kv.set(key, &[b'A'; 100]).unwrap();
                    }
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let name = name.clone();
            let keys = keys.clone();
            thread::spawn(move || {
                let mut kv = IpcKv::open(&name).unwrap();
                for round in 0..60 {
                    let key = &keys[round % keys.len()];
                    let value = kv.get(key).unwrap().expect("keys are never removed");
                    let torn = !(value == vec![b'A'; 100] || value == vec![b'B'; 200]);
                    assert!(!torn, "observed a torn value of length {}", value.len());
                }
            })
        })
        .collect();

    for writer in writers {
        writer.join().unwrap();
    }
    for reader in readers {
        reader.join().unwrap();
    }

    // Rewrites never change the entry count.
    assert_eq!(kv.size().unwrap(), keys.len());

    kv.destroy().unwrap();
}
