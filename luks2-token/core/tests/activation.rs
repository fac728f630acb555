use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use luks2_token::abi::{
    library_filename, ExportTable, StaticLoader, Symbol, SYMBOL_BUFFER_FREE, SYMBOL_OPEN,
    SYMBOL_VALIDATE,
};
use luks2_token::builtin::keyring::MemoryKeyring;
use luks2_token::header::DEFAULT_JSON_SIZE;
use luks2_token::{
    ActivateFlags, CryptDevice, DeviceActivator, HandlerRegistry, Header, Registry, Result,
    Target, TokenError, TokenRequest,
};
use zeroize::Zeroizing;

const VOLUME_KEY: [u8; 32] = [0x5a; 32];
const PASSPHRASE: &[u8] = b"correct horse";

#[derive(Default)]
struct Events {
    loaded: Vec<u32>,
    activated: Vec<(String, ActivateFlags)>,
    dropped: usize,
}

struct RecordingActivator {
    keyring: bool,
    fail_load: bool,
    events: Arc<Mutex<Events>>,
}

impl DeviceActivator for RecordingActivator {
    fn keyring_enabled(&self) -> bool {
        self.keyring
    }

    fn load_volume_key(&mut self, keyslot: u32, volume_key: &[u8]) -> Result<()> {
        assert_eq!(volume_key, &VOLUME_KEY);
        if self.fail_load {
            return Err(TokenError::NoMemory);
        }
        self.events.lock().unwrap().loaded.push(keyslot);
        Ok(())
    }

    fn activate(&mut self, name: &str, volume_key: &[u8], flags: ActivateFlags) -> Result<()> {
        assert_eq!(volume_key, &VOLUME_KEY);
        self.events
            .lock()
            .unwrap()
            .activated
            .push((name.to_string(), flags));
        Ok(())
    }

    fn drop_volume_key(&mut self, _volume_key: &[u8]) {
        self.events.lock().unwrap().dropped += 1;
    }
}

struct Fixture {
    loader: Arc<StaticLoader>,
    keyring: Arc<MemoryKeyring>,
    cd: CryptDevice,
}

fn fixture() -> Fixture {
    let loader = Arc::new(StaticLoader::new());
    let keyring = Arc::new(MemoryKeyring::default());
    let registry = Registry::new(HandlerRegistry::new(loader.clone(), keyring.clone()));
    let mut cd = CryptDevice::new(Header::new(DEFAULT_JSON_SIZE), registry);
    cd.keyslot_add_by_volume_key(Target::Any, &VOLUME_KEY, PASSPHRASE)
        .unwrap();
    Fixture { loader, keyring, cd }
}

fn install_open(loader: &StaticLoader, type_name: &str, result: Result<Vec<u8>>) {
    loader.install(&library_filename(type_name), move || {
        let result = result.clone();
        Box::new(ExportTable::new().export(
            SYMBOL_OPEN,
            Symbol::Open(Arc::new(move |_, _| result.clone().map(Zeroizing::new))),
        ))
    });
}

fn token_json(type_name: &str) -> String {
    format!(r#"{{"type":"{type_name}","keyslots":["0"]}}"#)
}

#[test]
fn test_any_token_stops_at_first_success() {
    let mut fx = fixture();
    let calls = Arc::new(AtomicUsize::new(0));
    for name in ["miss-a", "miss-b"] {
        let calls = calls.clone();
        fx.loader.install(&library_filename(name), move || {
            let calls = calls.clone();
            Box::new(ExportTable::new().export(
                SYMBOL_OPEN,
                Symbol::Open(Arc::new(move |_, _| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TokenError::NotFound)
                })),
            ))
        });
    }
    install_open(&fx.loader, "good", Ok(PASSPHRASE.to_vec()));

    for name in ["miss-a", "miss-b", "good"] {
        fx.cd
            .token_create(Target::Any, Some(&token_json(name)))
            .unwrap();
    }
    let before = fx.cd.header().clone();

    let events = Arc::new(Mutex::new(Events::default()));
    let mut cd = fx.cd.with_activator(Box::new(RecordingActivator {
        keyring: false,
        fail_load: false,
        events: events.clone(),
    }));

    let keyslot = cd
        .token_open_and_activate(&TokenRequest::new(Target::Any).name("vol"))
        .unwrap();

    assert_eq!(keyslot, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cd.header(), &before);

    let events = events.lock().unwrap();
    assert_eq!(events.activated.len(), 1);
    assert_eq!(events.activated[0].0, "vol");
    assert_eq!(events.dropped, 0);
}

#[test]
fn test_any_token_stops_on_hard_error() {
    let mut fx = fixture();
    install_open(&fx.loader, "busy", Err(TokenError::TryAgain));
    install_open(&fx.loader, "good", Ok(PASSPHRASE.to_vec()));
    fx.cd.token_create(Target::Id(0), Some(&token_json("busy"))).unwrap();
    fx.cd.token_create(Target::Id(1), Some(&token_json("good"))).unwrap();

    assert_eq!(
        fx.cd.token_open_and_activate(&TokenRequest::new(Target::Any)),
        Err(TokenError::TryAgain)
    );
}

#[test]
fn test_external_errors_are_narrowed() {
    let mut fx = fixture();
    install_open(&fx.loader, "leaky", Err(TokenError::InvalidArgument));
    let token = fx
        .cd
        .token_create(Target::Any, Some(&token_json("leaky")))
        .unwrap();

    assert_eq!(
        fx.cd.token_open_and_activate(&TokenRequest::new(Target::Id(token))),
        Err(TokenError::PermissionDenied)
    );
}

#[test]
fn test_wrong_secret_is_permission_denied() {
    let mut fx = fixture();
    install_open(&fx.loader, "stale", Ok(b"old passphrase".to_vec()));
    let token = fx
        .cd
        .token_create(Target::Any, Some(&token_json("stale")))
        .unwrap();

    assert_eq!(
        fx.cd.token_open_and_activate(&TokenRequest::new(Target::Id(token))),
        Err(TokenError::PermissionDenied)
    );
}

#[test]
fn test_buffer_freed_once_on_every_path() {
    let mut fx = fixture();
    let freed = Arc::new(AtomicUsize::new(0));
    let secret = Arc::new(Mutex::new(PASSPHRASE.to_vec()));
    {
        let freed = freed.clone();
        let secret = secret.clone();
        fx.loader.install(&library_filename("counted"), move || {
            let freed = freed.clone();
            let secret = secret.clone();
            Box::new(
                ExportTable::new()
                    .export(
                        SYMBOL_OPEN,
                        Symbol::Open(Arc::new(move |_, _| {
                            Ok(Zeroizing::new(secret.lock().unwrap().clone()))
                        })),
                    )
                    .export(
                        SYMBOL_BUFFER_FREE,
                        Symbol::BufferFree(Arc::new(move |buffer| {
                            freed.fetch_add(1, Ordering::SeqCst);
                            drop(buffer);
                        })),
                    ),
            )
        });
    }
    let token = fx
        .cd
        .token_create(Target::Any, Some(&token_json("counted")))
        .unwrap();

    fx.cd
        .token_open_and_activate(&TokenRequest::new(Target::Id(token)))
        .unwrap();
    assert_eq!(freed.load(Ordering::SeqCst), 1);

    *secret.lock().unwrap() = b"wrong".to_vec();
    assert!(fx
        .cd
        .token_open_and_activate(&TokenRequest::new(Target::Id(token)))
        .is_err());
    assert_eq!(freed.load(Ordering::SeqCst), 2);
}

#[test]
fn test_keyring_load_failure_fails_activation() {
    let mut fx = fixture();
    let freed = Arc::new(AtomicUsize::new(0));
    {
        let freed = freed.clone();
        fx.loader.install(&library_filename("counted"), move || {
            let freed = freed.clone();
            Box::new(
                ExportTable::new()
                    .export(
                        SYMBOL_OPEN,
                        Symbol::Open(Arc::new(|_, _| Ok(Zeroizing::new(PASSPHRASE.to_vec())))),
                    )
                    .export(
                        SYMBOL_BUFFER_FREE,
                        Symbol::BufferFree(Arc::new(move |_| {
                            freed.fetch_add(1, Ordering::SeqCst);
                        })),
                    ),
            )
        });
    }
    fx.cd
        .token_create(Target::Any, Some(&token_json("counted")))
        .unwrap();

    let events = Arc::new(Mutex::new(Events::default()));
    let mut cd = fx.cd.with_activator(Box::new(RecordingActivator {
        keyring: true,
        fail_load: true,
        events: events.clone(),
    }));

    assert_eq!(
        cd.token_open_and_activate(&TokenRequest::new(Target::Any).name("vol")),
        Err(TokenError::NoMemory)
    );
    assert_eq!(freed.load(Ordering::SeqCst), 1);

    let events = events.lock().unwrap();
    assert!(events.activated.is_empty());
    assert_eq!(events.dropped, 1);
}

#[test]
fn test_keyring_token_activates_through_keyring() {
    let mut fx = fixture();
    fx.keyring.add_user_key("cryptsetup:vol", PASSPHRASE);
    fx.cd
        .token_create(
            Target::Any,
            Some(r#"{"type":"luks2-keyring","keyslots":["0"],"key_description":"cryptsetup:vol"}"#),
        )
        .unwrap();

    let events = Arc::new(Mutex::new(Events::default()));
    let mut cd = fx.cd.with_activator(Box::new(RecordingActivator {
        keyring: true,
        fail_load: false,
        events: events.clone(),
    }));

    let keyslot = cd
        .token_open_and_activate(
            &TokenRequest::new(Target::Any)
                .name("vol")
                .token_type("luks2-keyring"),
        )
        .unwrap();
    assert_eq!(keyslot, 0);

    let events = events.lock().unwrap();
    assert_eq!(events.loaded, vec![0]);
    assert!(events.activated[0].1.keyring_key);

    drop(events);
    fx.keyring.unlink("cryptsetup:vol");
    assert_eq!(
        cd.token_open_and_activate(&TokenRequest::new(Target::Id(0))),
        Err(TokenError::NotFound)
    );
}

#[test]
fn test_type_filter_and_missing_open_pin() {
    let mut fx = fixture();
    install_open(&fx.loader, "plain", Ok(PASSPHRASE.to_vec()));
    let token = fx
        .cd
        .token_create(Target::Any, Some(&token_json("plain")))
        .unwrap();

    assert_eq!(
        fx.cd.token_open_and_activate(&TokenRequest::new(Target::Id(token)).token_type("other")),
        Err(TokenError::NotFound)
    );
    assert_eq!(
        fx.cd.token_open_and_activate(&TokenRequest::new(Target::Id(token)).pin(b"1234")),
        Err(TokenError::NotFound)
    );
}

#[test]
fn test_record_rejected_after_creation() {
    let mut fx = fixture();
    let accept = Arc::new(AtomicBool::new(true));
    {
        let accept = accept.clone();
        fx.loader.install(&library_filename("picky"), move || {
            let accept = accept.clone();
            Box::new(
                ExportTable::new()
                    .export(
                        SYMBOL_OPEN,
                        Symbol::Open(Arc::new(|_, _| Ok(Zeroizing::new(PASSPHRASE.to_vec())))),
                    )
                    .export(
                        SYMBOL_VALIDATE,
                        Symbol::Validate(Arc::new(move |_, _| {
                            if accept.load(Ordering::SeqCst) {
                                Ok(())
                            } else {
                                Err(TokenError::InvalidArgument)
                            }
                        })),
                    ),
            )
        });
    }
    let token = fx
        .cd
        .token_create(Target::Any, Some(&token_json("picky")))
        .unwrap();

    accept.store(false, Ordering::SeqCst);
    assert_eq!(
        fx.cd.token_open_and_activate(&TokenRequest::new(Target::Id(token))),
        Err(TokenError::NotFound)
    );
}

#[test]
fn test_unassigned_token_is_unusable() {
    let mut fx = fixture();
    install_open(&fx.loader, "plain", Ok(PASSPHRASE.to_vec()));
    let token = fx
        .cd
        .token_create(Target::Any, Some(r#"{"type":"plain","keyslots":[]}"#))
        .unwrap();

    assert_eq!(
        fx.cd.token_open_and_activate(&TokenRequest::new(Target::Id(token))),
        Err(TokenError::NotFound)
    );

    fx.cd
        .token_assign(Target::Id(0), Target::Id(token), true)
        .unwrap();
    assert_eq!(
        fx.cd.token_open_and_activate(&TokenRequest::new(Target::Id(token))),
        Ok(0)
    );
}
