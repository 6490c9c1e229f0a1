//! Property coverage for the round-trip / transparency laws in `spec.md`
//! §8: for any split of a payload into append chunks, and regardless of
//! `max_buffer_size`, `read_all`/`save_all_contents` reproduce the exact
//! concatenation of what was appended.

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use afs_engine::config::StagingBufferConfig;
use afs_engine::engine::Engine;
use afs_engine::staging_buffer::StagingBuffer;
use bytes::Bytes;
use proptest::prelude::*;
use tempdir::TempDir;

fn append_sync(buf: &Arc<StagingBuffer>, data: &[u8]) {
    let (tx, rx) = mpsc::channel();
    buf.append(
        Bytes::copy_from_slice(data),
        Box::new(move |size| {
            let _ = tx.send(size);
        }),
        Box::new(|_| panic!("append should not fail in this test")),
    );
    rx.recv().unwrap();
}

fn read_all_sync(buf: &Arc<StagingBuffer>) -> Vec<u8> {
    let (tx, rx) = mpsc::channel();
    buf.read_all(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    rx.recv().unwrap().unwrap().to_vec()
}

fn save_all_contents_sync(buf: &Arc<StagingBuffer>, dest: PathBuf) {
    let (tx, rx) = mpsc::channel();
    buf.save_all_contents(
        dest,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    rx.recv().unwrap().unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    // Invariant 1 / round-trip law: append(X); append(Y); read_all() ==
    // X++Y, independent of `max_buffer_size`.
    #[test]
    fn overwrite_read_all_reassembles_regardless_of_spill_threshold(
        chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..400), 0..8),
        max_buffer_size in 1usize..300,
    ) {
        let dir = TempDir::new("afs-prop").unwrap();
        let engine = Engine::new_inline();
        let config = StagingBufferConfig {
            max_buffer_size,
            disk_move_size: 64,
            swap_subdir: PathBuf::from("."),
        };
        let buf = StagingBuffer::overwrite(engine, dir.path(), config);

        let mut expected = Vec::new();
        for chunk in &chunks {
            append_sync(&buf, chunk);
            expected.extend_from_slice(chunk);
        }

        prop_assert_eq!(read_all_sync(&buf), expected.clone());

        let dest = dir.path().join("out.bin");
        save_all_contents_sync(&buf, dest.clone());
        prop_assert_eq!(std::fs::read(&dest).unwrap(), expected);
    }

    // Same law for the Append variant: read_all() == original ++ X ++ Y.
    #[test]
    fn append_variant_save_all_contents_prepends_original_regardless_of_spill_threshold(
        original in proptest::collection::vec(any::<u8>(), 0..200),
        chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..400), 0..6),
        max_buffer_size in 1usize..300,
    ) {
        let dir = TempDir::new("afs-prop").unwrap();
        let original_path = dir.path().join("orig.bin");
        std::fs::write(&original_path, &original).unwrap();

        let engine = Engine::new_inline();
        let config = StagingBufferConfig {
            max_buffer_size,
            disk_move_size: 64,
            swap_subdir: PathBuf::from("."),
        };
        let buf = StagingBuffer::append_to(engine, dir.path(), original_path.clone(), config);

        let mut expected = original.clone();
        for chunk in &chunks {
            append_sync(&buf, chunk);
            expected.extend_from_slice(chunk);
        }

        prop_assert_eq!(read_all_sync(&buf), expected.clone());

        // Per spec.md §8 scenario S3, the Append variant commits by
        // appending onto the original file itself, not a fresh destination.
        save_all_contents_sync(&buf, original_path.clone());
        prop_assert_eq!(std::fs::read(&original_path).unwrap(), expected);
    }
}
