#![no_main]

use libfuzzer_sys::fuzz_target;
use pmq::commit::CommitRecord;

fuzz_target!(|data: &[u8]| {
    if let Ok(mut rec) = CommitRecord::decode(data) {
        // Anything that decodes must re-encode and validate without panicking.
        rec.reconcile_wal();
        let _ = rec.validate();
        let _ = rec.encode();
    }
});
