#![no_main]

use libfuzzer_sys::fuzz_target;

use infrastructure::config::Config;

/// Cap on document size; larger inputs only slow the fuzzer down.
const MAX_DOC_LEN: usize = 1 << 16;

// Untrusted YAML must come back as Ok or Err, never a panic. A document
// that passes validation must also survive conversion into domain specs.
fuzz_target!(|data: &[u8]| {
    let Ok(doc) = std::str::from_utf8(data) else {
        return;
    };
    if doc.len() > MAX_DOC_LEN {
        return;
    }

    if let Ok(config) = Config::from_yaml(doc) {
        let _ = config.service_specs();
    }
});
