//! Integration tests for tessera-token

use std::sync::Arc;
use tessera_token::*;

#[test]
fn test_provider_as_trait_object() {
    let provider: Arc<dyn TokenProvider> = Arc::new(RandomTokenProvider::default());

    let id = provider.generate_session_id();
    let token = provider.generate_token();

    assert!(!id.is_empty());
    assert_ne!(id, token);
}

#[test]
fn test_custom_length() {
    let provider = RandomTokenProvider::new(24).unwrap();

    // 24 bytes encode to exactly 32 base64 characters
    assert_eq!(provider.generate_token().len(), 32);
}

#[test]
fn test_entropy_error_display() {
    let err = RandomTokenProvider::new(4).unwrap_err();
    let display = format!("{}", err);
    assert!(display.contains("4 bytes"));
    assert!(display.contains("16 bytes"));
}

#[test]
fn test_csrf_double_submit() {
    let provider = RandomTokenProvider::default();
    let stored = provider.generate_token();
    let submitted = stored.clone();
    let forged = provider.generate_token();

    assert!(tokens_match(&stored, &submitted));
    assert!(!tokens_match(&stored, &forged));
}

#[test]
fn test_generation_across_threads() {
    let provider = Arc::new(RandomTokenProvider::default());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let provider = provider.clone();
            std::thread::spawn(move || {
                (0..100)
                    .map(|_| provider.generate_session_id())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut all = std::collections::HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(all.insert(id));
        }
    }
    assert_eq!(all.len(), 400);
}
