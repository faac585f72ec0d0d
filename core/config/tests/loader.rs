// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use tern_config::component::configuration::Configuration;
use tern_config::{ConfigLoader, Network};

static TEST_DATA_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/testdata");

#[test]
fn test_endpoint_from_file_builds_tls() {
    let mut loader = ConfigLoader::new(&format!("{}/config.yaml", TEST_DATA_PATH)).unwrap();
    let endpoint = loader.endpoint().unwrap().clone();

    assert_eq!(endpoint.network, Network::Tcp);
    assert_eq!(endpoint.listen_addr(), "127.0.0.1:46000");
    assert_eq!(endpoint.session_age(), Some(Duration::from_secs(3600)));
    assert_eq!(endpoint.slow_cost(), Some(Duration::from_millis(500)));
    assert_eq!(endpoint.max_message_size, 1 << 20);
    assert!(endpoint.validate().is_ok());

    let strategy = endpoint.redial_strategy();
    assert_eq!(strategy.max_attempts(), Some(3));
    assert_eq!(strategy.interval(), Duration::from_millis(200));

    // paths in the file are relative to the crate root
    let mut tls = endpoint.tls.unwrap();
    for p in [&mut tls.cert_file, &mut tls.key_file, &mut tls.ca_file] {
        let rel = p.take().unwrap();
        *p = Some(format!(
            "{}/{}",
            env!("CARGO_MANIFEST_DIR"),
            rel.trim_start_matches("./")
        ));
    }
    assert!(tls.load_server_config().is_ok());
    assert!(tls.load_client_config().is_ok());
    assert_eq!(tls.server_name, "localhost");
}
