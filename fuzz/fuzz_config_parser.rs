//! Config files that load must survive `vnids config --show`: rendering a
//! parsed config back to TOML yields a file that loads to the same values.
//!
//! cargo +nightly fuzz run fuzz_config_parser

#![no_main]

use libfuzzer_sys::fuzz_target;
use vnids_config::AppConfig;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(config) = AppConfig::parse(text) else {
        return;
    };
    let rendered = toml::to_string_pretty(&config).expect("valid config renders");
    let again = AppConfig::parse(&rendered).expect("rendered config loads");

    assert_eq!(config.ipc.socket_path, again.ipc.socket_path);
    assert_eq!(config.ipc.max_frame_bytes, again.ipc.max_frame_bytes);
    assert_eq!(config.engine.binary, again.engine.binary);
    assert_eq!(config.events.max_events, again.events.max_events);
    assert_eq!(config.storage.database, again.storage.database);
});
