//! Property tests for the chunk file layout produced by compaction.
//!
//! Every written chunk must carry a valid header, an offset table placed at the end of the
//! chunk starting at offset 16, and MSNs that continue exactly where the previous chunk ended.

mod support;

use pmq::formats::{ChunkHeader, CHUNKS_FILE, CHUNK_HEADER_SIZE, CHUNK_SIZE};
use pmq::storage::Directory;
use pmq::{MemoryDirectory, Queue};
use proptest::prelude::*;
use std::sync::Arc;
use support::{payload, small_config};

fn read_chunk(dir: &MemoryDirectory, csn: u64) -> Vec<u8> {
    let f = dir.open_file(CHUNKS_FILE).unwrap();
    let mut buf = vec![0u8; CHUNK_SIZE];
    f.read_exact_at(&mut buf, csn * CHUNK_SIZE as u64).unwrap();
    buf
}

fn offset(chunk: &[u8], at: usize) -> usize {
    u16::from_le_bytes([chunk[at], chunk[at + 1]]) as usize
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 16,
        failure_persistence: None,
        .. ProptestConfig::default()
    })]

    #[test]
    fn written_chunks_are_well_formed(
        sizes in prop::collection::vec(1usize..=30_000, 10..80)
    ) {
        let dir = MemoryDirectory::new();
        let q = Queue::open_in(Arc::new(dir.clone()), &small_config()).unwrap();
        let msgs: Vec<Vec<u8>> = sizes
            .iter()
            .enumerate()
            .map(|(i, n)| payload(i as u64, *n))
            .collect();
        for m in &msgs {
            q.enqueue(m).unwrap();
        }
        q.sync().unwrap();
        let info = q.persist_info();

        let mut next_msn = 0u64;
        let mut csn = 0u64;
        while next_msn < info.cks_msn {
            let chunk = read_chunk(&dir, csn);
            let hdr = ChunkHeader::parse(&chunk).unwrap();
            hdr.validate(csn).unwrap();
            prop_assert_eq!(hdr.msn, next_msn);

            let count = hdr.msgcount as usize;
            let table = hdr.msgoffsets_off as usize;
            prop_assert_eq!(table, CHUNK_SIZE - 2 * (count + 1));
            prop_assert_eq!(offset(&chunk, table), CHUNK_HEADER_SIZE);
            for i in 0..count {
                let (s, e) = (offset(&chunk, table + 2 * i), offset(&chunk, table + 2 * i + 2));
                let msn = hdr.msn as usize + i;
                prop_assert_eq!(e - s, msgs[msn].len());
                prop_assert!(&chunk[s..e] == &msgs[msn][..]);
            }
            let end = offset(&chunk, table + 2 * count);
            prop_assert!(chunk[end..table].iter().all(|b| *b == 0));

            next_msn = hdr.end_msn();
            csn += 1;
        }
        prop_assert_eq!(next_msn, info.cks_msn);
    }
}
