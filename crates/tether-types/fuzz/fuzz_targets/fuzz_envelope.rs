#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Decoding arbitrary frames should only ever return Ok or Err
    if let Ok(s) = std::str::from_utf8(data)
        && let Ok(envelope) = tether_rpc::decode(s)
    {
        let _ = tether_rpc::encode(&envelope);
    }
});
