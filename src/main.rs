use std::sync::Arc;

use tks::prelude::*;

fn main() -> TksResult<()> {
    println!("Token Key Service demo");

    let config = ServiceConfig {
        connectors: vec![
            Connector::new("tps-01", "tps-01-transport")
                .allow("shared-secret-1")
                .allow("family-*"),
            Connector::new("tps-02", "tps-02-transport"),
        ],
        ..ServiceConfig::default()
    };
    let service = SharedSecretService::from_config(config, Arc::new(LogAuditSink))?;
    service.vault().generate_master("tks-master")?;

    for (id, key_type, algorithm) in [
        ("tps-01-transport", KeyType::Transport, KeyAlgorithm::Aes256),
        ("tps-02-transport", KeyType::Transport, KeyAlgorithm::Aes256),
        ("shared-secret-1", KeyType::SharedSecret, KeyAlgorithm::Aes128),
        ("family-des3", KeyType::Session, KeyAlgorithm::Des3),
        ("family-aes", KeyType::Session, KeyAlgorithm::Aes128),
    ] {
        let record = service.provision_key(KeySpec::new(id, key_type, algorithm))?;
        println!("Provisioned {} ({} {}) v{}", record.id, record.key_type, record.algorithm, record.version);
    }

    let kdd = [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09];
    let requests = [
        SharedSecretRequest::new("tps-01", "shared-secret-1"),
        SharedSecretRequest::new("tps-02", "shared-secret-1"),
        SharedSecretRequest::new("tps-01", "missing-key"),
        SharedSecretRequest::new("tps-01", "family-des3").with_diversifier(kdd.to_vec()),
        SharedSecretRequest::new("tps-01", "family-aes").with_diversifier(kdd.to_vec()),
    ];

    for request in &requests {
        match service.handle(request) {
            Ok(response) => {
                println!(
                    "{} -> {}: {} bytes under {}",
                    request.connector_id,
                    request.key_id,
                    response.wrapped_bytes.len(),
                    response.wrapping_scheme
                );
                if let Some(kcv) = &response.check_value {
                    println!("  check value {}", kcv);
                }
                if let Some(derivation) = &response.derivation {
                    println!("  {} check values {:?}", derivation.scheme, derivation.check_values);
                }
            }
            Err(e) => println!("{} -> {}: {}", request.connector_id, request.key_id, e),
        }
    }

    let info = service.show_key("tps-01", "family-des3", None)?;
    println!(
        "{} v{} {} {} check value {}",
        info.id,
        info.version,
        info.algorithm,
        info.status,
        info.check_value.as_deref().unwrap_or("-")
    );

    Ok(())
}
