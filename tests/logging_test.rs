//! Installing the global subscriber. Kept in its own test binary: the unit
//! tests install `tracing-test`'s subscriber in the library's test process.

use nomic_ops::config::{LogFormat, ObservingConfig};
use nomic_ops::logging::{self, LogOptions};
use tracing::Level;

#[test]
fn test_second_init_is_a_no_op() {
    let options = LogOptions::new(Level::WARN, LogFormat::Compact);
    logging::init(options.clone()).unwrap();
    assert!(tracing::dispatcher::has_been_set());
    logging::init(options).unwrap();

    let mut config = ObservingConfig::default();
    config.application.log_format = LogFormat::Json;
    logging::init_from_config(&config).unwrap();
}

#[test]
fn test_invalid_level_is_rejected_before_install() {
    let mut config = ObservingConfig::default();
    config.application.log_level = "chatty".to_string();
    let err = logging::init_from_config(&config).unwrap_err();
    assert!(err.to_string().contains("chatty"));
}
