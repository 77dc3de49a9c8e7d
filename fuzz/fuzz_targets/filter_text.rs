#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(filter) = ldap_client::filter_text::parse_filter(s) {
            let _ = ldap_client::filter_text::render_filter(&filter);
        }
    }
});
