use std::collections::HashSet;

use tempfile::{TempDir, tempdir};
use uuid::Uuid;

use crate::broker::message::{Destination, Message, OutgoingMessage};
use crate::persistence::codec::{self, HEADERS, SENT};
use crate::persistence::{OUTGOING_TREE, Store};
use crate::utils::QueueError;

fn open_store() -> (Store, TempDir) {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    (store, dir)
}

fn hello() -> Message {
    Message::new("h", "hello").with_header("k", "myvalue")
}

fn assert_absent(store: &Store, queue: &str, id: Uuid) {
    assert_eq!(store.get(queue, &codec::payload_key(&id)).unwrap(), None);
    assert_eq!(store.get(queue, &codec::entry_key(&id, HEADERS)).unwrap(), None);
    assert_eq!(store.get(queue, &codec::entry_key(&id, SENT)).unwrap(), None);
}

#[tokio::test]
async fn happy_path_survives_reopen() {
    let (store, dir) = open_store();
    let message = hello();
    store.create_queue("h").await.unwrap();

    let mut tx = store.begin_transaction();
    tx.store_incoming(std::slice::from_ref(&message)).unwrap();
    tx.commit().await.unwrap();
    store.close().unwrap();

    let store = Store::open(dir.path()).unwrap();
    let payload = store.get("h", &codec::payload_key(&message.id)).unwrap();
    assert_eq!(payload.as_deref(), Some(&b"hello"[..]));
    let headers = store
        .get("h", &codec::entry_key(&message.id, HEADERS))
        .unwrap()
        .unwrap();
    let headers = codec::decode_headers(&headers).unwrap();
    assert_eq!(headers.get("k").map(String::as_str), Some("myvalue"));

    let read_back = store.message("h", message.id).unwrap().unwrap();
    assert_eq!(read_back, message);
}

#[tokio::test]
async fn storing_into_missing_queue_fails_on_commit() {
    let (store, _dir) = open_store();
    let mut tx = store.begin_transaction();
    tx.store_incoming(&[Message::new("nowhere", "x")]).unwrap();

    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, QueueError::QueueDoesNotExist(ref q) if q == "nowhere"));
    assert!(!store.queue_exists("nowhere"));
}

#[tokio::test]
async fn missing_queue_leaves_no_partial_records_in_other_queues() {
    let (store, _dir) = open_store();
    store.create_queue("h").await.unwrap();
    let good = hello();

    let mut tx = store.begin_transaction();
    tx.store_incoming(&[good.clone(), Message::new("nowhere", "x")])
        .unwrap();
    let err = tx.commit().await.unwrap_err();

    assert!(matches!(err, QueueError::QueueDoesNotExist(_)));
    assert_absent(&store, "h", good.id);
}

#[tokio::test]
async fn crash_before_commit_leaves_nothing() {
    let (store, dir) = open_store();
    let message = hello();
    store.create_queue("h").await.unwrap();

    let mut tx = store.begin_transaction();
    tx.store_incoming(std::slice::from_ref(&message)).unwrap();
    // crash
    drop(tx);
    store.close().unwrap();

    let store = Store::open(dir.path()).unwrap();
    assert!(store.queue_exists("h"));
    assert_absent(&store, "h", message.id);
    assert!(store.messages("h", None).unwrap().is_empty());
}

#[tokio::test]
async fn rollback_leaves_nothing() {
    let (store, dir) = open_store();
    let message = hello();
    store.create_queue("h").await.unwrap();

    let mut tx = store.begin_transaction();
    tx.store_incoming(std::slice::from_ref(&message)).unwrap();
    tx.rollback();
    assert_absent(&store, "h", message.id);
    store.close().unwrap();

    let store = Store::open(dir.path()).unwrap();
    assert_absent(&store, "h", message.id);
}

#[test]
fn reopening_repeatedly_keeps_committed_state() {
    let dir = tempdir().unwrap();
    let message = hello();
    {
        let store = Store::open(dir.path()).unwrap();
        store.create_queue_blocking("h").unwrap();
        let mut tx = store.begin_transaction();
        tx.store_incoming(std::slice::from_ref(&message)).unwrap();
        tx.commit_blocking().unwrap();
        store.close().unwrap();
    }
    for _ in 0..3 {
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.queue_names(), vec!["h".to_string()]);
        assert_eq!(store.messages("h", None).unwrap(), vec![message.clone()]);
        store.close().unwrap();
    }
}

#[tokio::test]
async fn multi_queue_transaction_is_all_or_nothing() {
    let (store, _dir) = open_store();
    store.create_queue("a").await.unwrap();
    store.create_queue("b").await.unwrap();
    let batch = vec![
        Message::new("a", "1"),
        Message::new("b", "2"),
        Message::new("a", "3"),
    ];

    let mut tx = store.begin_transaction();
    tx.store_incoming(&batch).unwrap();
    tx.commit().await.unwrap();

    for message in &batch {
        let stored = store.message(&message.queue, message.id).unwrap();
        assert_eq!(stored.as_ref(), Some(message));
    }
    assert_eq!(store.messages("a", None).unwrap().len(), 2);
    assert_eq!(store.messages("b", None).unwrap().len(), 1);
}

#[tokio::test]
async fn creating_a_queue_twice_is_harmless() {
    let (store, _dir) = open_store();
    store.create_queue("h").await.unwrap();
    store.create_queue("h").await.unwrap();
    assert_eq!(store.queue_names(), vec!["h".to_string()]);
}

#[tokio::test]
async fn reserved_and_empty_queue_names_are_rejected() {
    let (store, _dir) = open_store();
    for name in ["", OUTGOING_TREE, "__mine"] {
        let err = store.create_queue(name).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidQueueName(_)), "{name}");
    }
    assert!(store.queue_names().is_empty());
}

#[tokio::test]
async fn transaction_reads_its_own_writes() {
    let (store, _dir) = open_store();
    store.create_queue("h").await.unwrap();
    store
        .execute(|tx| {
            tx.put("h", "a", "committed");
            Ok(())
        })
        .await
        .unwrap();

    let mut tx = store.begin_transaction();
    assert_eq!(tx.get("h", b"a").unwrap(), Some(b"committed".to_vec()));
    tx.put("h", "a", "buffered");
    assert_eq!(tx.get("h", b"a").unwrap(), Some(b"buffered".to_vec()));
    tx.delete("h", "a");
    assert_eq!(tx.get("h", b"a").unwrap(), None);
    // nothing visible outside until commit
    assert_eq!(store.get("h", b"a").unwrap(), Some(b"committed".to_vec()));
    tx.commit().await.unwrap();
    assert_eq!(store.get("h", b"a").unwrap(), None);
}

#[tokio::test]
async fn reading_missing_queue_is_an_error() {
    let (store, _dir) = open_store();
    assert!(matches!(
        store.messages("nowhere", None),
        Err(QueueError::QueueDoesNotExist(_))
    ));
    let tx = store.begin_transaction();
    assert!(matches!(
        tx.get("nowhere", b"k"),
        Err(QueueError::QueueDoesNotExist(_))
    ));
}

#[tokio::test]
async fn failing_unit_of_work_rolls_back_and_writer_keeps_going() {
    let (store, _dir) = open_store();
    store.create_queue("h").await.unwrap();
    let doomed = hello();

    let err = store
        .execute(move |tx| {
            tx.store_incoming(std::slice::from_ref(&doomed))?;
            Err::<(), _>(QueueError::Storage("disk on fire".into()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Storage(_)));
    assert!(store.messages("h", None).unwrap().is_empty());

    let survivor = hello();
    let id = survivor.id;
    store
        .execute(move |tx| tx.store_incoming(&[survivor]))
        .await
        .unwrap();
    assert!(store.message("h", id).unwrap().is_some());
}

#[tokio::test]
async fn panicking_unit_of_work_is_isolated() {
    let (store, _dir) = open_store();
    store.create_queue("h").await.unwrap();

    let err = store
        .execute(|tx| -> crate::utils::Result<()> {
            tx.put("h", "k", "v");
            panic!("boom");
        })
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::WorkPanicked));
    assert_eq!(store.get("h", b"k").unwrap(), None);

    let value = store
        .execute(|tx| {
            tx.put("h", "k", "v2");
            Ok(42)
        })
        .await
        .unwrap();
    assert_eq!(value, 42);
    assert_eq!(store.get("h", b"k").unwrap(), Some(b"v2".to_vec()));
}

#[tokio::test]
async fn units_of_work_see_earlier_commits() {
    let (store, _dir) = open_store();
    store.create_queue("counter").await.unwrap();

    for _ in 0..10 {
        store
            .execute(|tx| {
                let current = tx
                    .get("counter", b"n")?
                    .map(|raw| u64::from_be_bytes(raw.try_into().unwrap_or([0; 8])))
                    .unwrap_or(0);
                tx.put("counter", "n", (current + 1).to_be_bytes().to_vec());
                Ok(())
            })
            .await
            .unwrap();
    }

    let raw = store.get("counter", b"n").unwrap().unwrap();
    assert_eq!(u64::from_be_bytes(raw.try_into().unwrap()), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_store_every_message_once() {
    let (store, _dir) = open_store();
    store.create_queue("h").await.unwrap();

    let mut handles = Vec::new();
    for i in 0..100 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let message = Message::new("h", format!("msg{i}")).with_header("n", i.to_string());
            let id = message.id;
            store
                .execute(move |tx| tx.store_incoming(&[message]))
                .await
                .map(|()| id)
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap().unwrap());
    }
    assert_eq!(ids.len(), 100);

    let stored = store.messages("h", None).unwrap();
    assert_eq!(stored.len(), 100);
    let stored_ids: HashSet<Uuid> = stored.iter().map(|m| m.id).collect();
    assert_eq!(stored_ids, ids);
    for message in stored {
        assert!(message.payload.starts_with(b"msg"));
        assert!(message.headers.contains_key("n"));
    }
}

#[test]
fn concurrent_blocking_writers_from_threads() {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    store.create_queue_blocking("h").unwrap();

    let threads: Vec<_> = (0..8)
        .map(|t| {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..10 {
                    let message = Message::new("h", format!("{t}-{i}"));
                    store
                        .execute_blocking(move |tx| tx.store_incoming(&[message]))
                        .unwrap();
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(store.messages("h", None).unwrap().len(), 80);
}

#[tokio::test]
async fn outgoing_messages_round_trip_through_the_store() {
    let (store, dir) = open_store();
    let outgoing = OutgoingMessage::new(Destination::new("localhost:2200", "h"), "ping")
        .with_max_attempts(5);

    let mut tx = store.begin_transaction();
    tx.store_outgoing(std::slice::from_ref(&outgoing)).unwrap();
    tx.commit().await.unwrap();
    store.close().unwrap();

    let store = Store::open(dir.path()).unwrap();
    assert_eq!(store.outgoing_messages().unwrap(), vec![outgoing.clone()]);

    let mut tx = store.begin_transaction();
    tx.delete_outgoing(outgoing.id());
    tx.commit().await.unwrap();
    assert!(store.outgoing_messages().unwrap().is_empty());
}

#[tokio::test]
async fn commit_after_close_reports_writer_closed() {
    let (store, _dir) = open_store();
    store.create_queue("h").await.unwrap();
    let mut tx = store.begin_transaction();
    tx.store_incoming(&[hello()]).unwrap();

    store.close().unwrap();
    assert!(matches!(tx.commit().await, Err(QueueError::WriterClosed)));
}
