#![no_main]
use ldap_client::ldap::LdapMessage;
use ldap_client::FromBer;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = LdapMessage::from_ber(data);
});
