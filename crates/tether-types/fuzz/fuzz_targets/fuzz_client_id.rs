#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Parsing must never panic, and anything that parses must rebuild to a
    // string that parses to the same identity
    if let Ok(s) = std::str::from_utf8(data)
        && let Ok(identity) = tether_types::ClientIdentity::parse(s)
    {
        let rebuilt = tether_types::ClientIdentity::parse(&identity.build());
        assert_eq!(rebuilt.as_ref(), Ok(&identity));
    }
});
