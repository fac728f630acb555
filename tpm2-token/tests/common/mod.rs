#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use luks2_token::abi::StaticLoader;
use luks2_token::builtin::keyring::MemoryKeyring;
use luks2_token::header::DEFAULT_JSON_SIZE;
use luks2_token::{CryptDevice, HandlerRegistry, Header, Registry, Result, Target, TokenError};
use tpm2_token::backend::{BackendError, BackendResult, NvPolicy};
use tpm2_token::{PcrBanks, Prompt, SecretStore, SecretStoreConnector, Tcti};
use zeroize::Zeroizing;

pub const VOLUME_KEY: [u8; 32] = [0x42; 32];
pub const PASSPHRASE: &[u8] = b"existing passphrase";
pub const PIN: &[u8] = b"1234";

const NV_BASE: u32 = 0x0180_0000;

#[derive(Debug, Clone)]
pub struct NvSpace {
    pub data: Vec<u8>,
    pub auth: Option<Vec<u8>>,
    pub policy: NvPolicy,
    pub da_protect: bool,
}

/// In-memory TPM accepting any policy.
#[derive(Default)]
pub struct FakeTpm {
    pub nv: HashMap<u32, NvSpace>,
    /// Every buffer handed out by `get_random`, in order.
    pub random: Vec<Vec<u8>>,
    pub undefined: Vec<u32>,
    pub unsupported_banks: PcrBanks,
    pub capability_error: bool,
    seed: u8,
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    pub tpm: Arc<Mutex<FakeTpm>>,
    unreachable: Arc<AtomicBool>,
    /// TCTIs served by another module (`Some`) or refusing connections
    /// (`None`). Any other TCTI reaches `tpm`.
    routes: Arc<Mutex<HashMap<String, Option<Arc<Mutex<FakeTpm>>>>>>,
    devices: Arc<Mutex<HashSet<PathBuf>>>,
    pub connections: Arc<Mutex<Vec<Option<String>>>>,
}

impl FakeConnector {
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Serve `tcti` from `tpm` instead of the default module.
    pub fn route(&self, tcti: &str, tpm: Arc<Mutex<FakeTpm>>) {
        self.routes.lock().unwrap().insert(tcti.to_string(), Some(tpm));
    }

    pub fn refuse(&self, tcti: &str) {
        self.routes.lock().unwrap().insert(tcti.to_string(), None);
    }

    /// Make `/dev/tpmrm<N>` accessible for every `N` in `nodes`.
    pub fn add_devices(&self, nodes: &[u32]) {
        let mut devices = self.devices.lock().unwrap();
        for node in nodes {
            devices.insert(PathBuf::from(format!("/dev/tpmrm{node}")));
        }
    }

    pub fn take_connections(&self) -> Vec<Option<String>> {
        std::mem::take(&mut *self.connections.lock().unwrap())
    }
}

impl SecretStoreConnector for FakeConnector {
    fn connect(&self, tcti: Option<&Tcti>) -> BackendResult<Box<dyn SecretStore>> {
        let name = tcti.map(Tcti::to_string);
        self.connections.lock().unwrap().push(name.clone());

        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BackendError::Failed("connection refused".into()));
        }

        let routed = name.and_then(|name| self.routes.lock().unwrap().get(&name).cloned());
        let tpm = match routed {
            Some(Some(tpm)) => tpm,
            Some(None) => return Err(BackendError::Failed("connection refused".into())),
            None => self.tpm.clone(),
        };

        Ok(Box::new(FakeStore { tpm }))
    }

    fn device_accessible(&self, path: &Path) -> bool {
        self.devices.lock().unwrap().contains(path)
    }
}

struct FakeStore {
    tpm: Arc<Mutex<FakeTpm>>,
}

impl SecretStore for FakeStore {
    fn supports_pcr_banks(&mut self, banks: PcrBanks, _pcrs: u32) -> BackendResult<bool> {
        let tpm = self.tpm.lock().unwrap();
        if tpm.capability_error {
            return Err(BackendError::Failed("capability query failed".into()));
        }
        Ok(banks.bits() & tpm.unsupported_banks.bits() == 0)
    }

    fn get_random(&mut self, len: usize) -> BackendResult<Zeroizing<Vec<u8>>> {
        let mut tpm = self.tpm.lock().unwrap();
        let bytes: Vec<u8> = (0..len)
            .map(|i| tpm.seed.wrapping_mul(31).wrapping_add(i as u8))
            .collect();
        tpm.seed = tpm.seed.wrapping_add(1);
        tpm.random.push(bytes.clone());
        Ok(Zeroizing::new(bytes))
    }

    fn nv_define_and_write(
        &mut self,
        index: Option<u32>,
        data: &[u8],
        auth: Option<&[u8]>,
        policy: NvPolicy,
        da_protect: bool,
    ) -> BackendResult<u32> {
        let mut tpm = self.tpm.lock().unwrap();
        let index = match index {
            Some(index) if tpm.nv.contains_key(&index) => {
                return Err(BackendError::Failed("NV index already defined".into()));
            }
            Some(index) => index,
            None => (NV_BASE..)
                .find(|index| !tpm.nv.contains_key(index))
                .unwrap(),
        };

        tpm.nv.insert(
            index,
            NvSpace {
                data: data.to_vec(),
                auth: auth.map(<[u8]>::to_vec),
                policy,
                da_protect,
            },
        );
        Ok(index)
    }

    fn nv_read(
        &mut self,
        index: u32,
        auth: Option<&[u8]>,
        policy: NvPolicy,
        len: usize,
    ) -> BackendResult<Zeroizing<Vec<u8>>> {
        let tpm = self.tpm.lock().unwrap();
        let space = tpm
            .nv
            .get(&index)
            .ok_or_else(|| BackendError::Failed("NV index not defined".into()))?;

        if space.policy != policy || space.auth.as_deref() != auth {
            return Err(BackendError::AuthFailed);
        }

        let len = len.min(space.data.len());
        Ok(Zeroizing::new(space.data[..len].to_vec()))
    }

    fn nv_undefine(&mut self, index: u32) -> BackendResult<()> {
        let mut tpm = self.tpm.lock().unwrap();
        tpm.nv
            .remove(&index)
            .ok_or_else(|| BackendError::Failed("NV index not defined".into()))?;
        tpm.undefined.push(index);
        Ok(())
    }
}

/// Answers prompts from a fixed script.
#[derive(Default)]
pub struct ScriptedPrompt {
    answers: VecDeque<Vec<u8>>,
    pub asked: Vec<(String, bool)>,
}

impl ScriptedPrompt {
    pub fn new(answers: &[&[u8]]) -> Self {
        Self {
            answers: answers.iter().map(|a| a.to_vec()).collect(),
            asked: Vec::new(),
        }
    }
}

impl Prompt for ScriptedPrompt {
    fn passphrase(
        &mut self,
        message: &str,
        _timeout: Option<Duration>,
        verify: bool,
    ) -> Result<Zeroizing<Vec<u8>>> {
        self.asked.push((message.to_string(), verify));
        self.answers
            .pop_front()
            .map(Zeroizing::new)
            .ok_or(TokenError::InvalidArgument)
    }
}

pub struct Fixture {
    pub connector: FakeConnector,
    pub cd: CryptDevice,
}

/// Device with keyslot 0 opened by [`PASSPHRASE`] and the tpm2 library
/// installed over a fake TPM.
pub fn fixture() -> Fixture {
    let connector = FakeConnector::default();
    let loader = Arc::new(StaticLoader::new());
    tpm2_token::install(&loader, Arc::new(connector.clone()));

    let keyring = Arc::new(MemoryKeyring::default());
    let registry = Registry::new(HandlerRegistry::new(loader, keyring));
    let mut cd = CryptDevice::new(Header::new(DEFAULT_JSON_SIZE), registry);
    cd.keyslot_add_by_volume_key(Target::Id(0), &VOLUME_KEY, PASSPHRASE)
        .unwrap();

    Fixture { connector, cd }
}
