//! TPM 2.0 secret store over the TSS Enhanced System API.

use std::ops::RangeInclusive;
use std::str::FromStr;

use tss_esapi::Context as TpmContext;
use tss_esapi::attributes::NvIndexAttributesBuilder;
use tss_esapi::constants::{CapabilityType, SessionType};
use tss_esapi::handles::{NvIndexHandle, NvIndexTpmHandle, ObjectHandle, SessionHandle, TpmHandle};
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::interface_types::resource_handles::{NvAuth, Provision};
use tss_esapi::interface_types::session_handles::{AuthSession, PolicySession};
use tss_esapi::structures::{
    Auth, CapabilityData, Digest, MaxNvBuffer, NvPublicBuilder, PcrSelectionList, PcrSlot,
    SymmetricDefinition,
};
use tss_esapi::tcti_ldr::TctiNameConf;
use tss_esapi::tss2_esys::TSS2_RC;
use zeroize::Zeroizing;

use crate::backend::{
    BackendError, BackendResult, NvPolicy, SecretStore, SecretStoreConnector, Tcti,
};
use crate::record::{pcr_numbers, PcrBanks};

/// First handle of the owner NV index range.
const NV_INDEX_BASE: u32 = 0x0180_0000;
/// Handles probed when looking for a free NV index.
const NV_INDEX_SEARCH: u32 = 0x1000;

/// Largest chunk requested from the random number generator at once.
const RANDOM_CHUNK: usize = 32;

const RC_FMT1: u32 = 0x080;
const RC_VER1: u32 = 0x100;
const RC_AUTH_FAIL: u32 = RC_FMT1 + 0x00e;
const RC_BAD_AUTH: u32 = RC_FMT1 + 0x022;
const RC_POLICY_FAIL: u32 = RC_FMT1 + 0x01d;
const RC_NV_DEFINED: u32 = RC_VER1 + 0x04c;

/// TPM response code without the layer bits, if `e` carries one.
fn response_code(e: &tss_esapi::Error) -> Option<u32> {
    match e {
        tss_esapi::Error::TssError(rc) => Some(TSS2_RC::from(*rc) & 0xffff),
        _ => None,
    }
}

/// Error number of a format-one response code, without the parameter,
/// handle or session number.
fn fmt1_error(rc: u32) -> Option<u32> {
    (rc & RC_FMT1 != 0).then_some(RC_FMT1 | (rc & 0x3f))
}

fn backend_error(e: tss_esapi::Error) -> BackendError {
    let auth_failure = response_code(&e)
        .and_then(fmt1_error)
        .is_some_and(|rc| matches!(rc, RC_AUTH_FAIL | RC_BAD_AUTH | RC_POLICY_FAIL));

    if auth_failure {
        BackendError::AuthFailed
    } else {
        BackendError::Failed(e.to_string())
    }
}

fn nv_defined(e: &tss_esapi::Error) -> bool {
    response_code(e).is_some_and(|rc| rc & 0x97f == RC_NV_DEFINED)
}

/// Handles tried for a new NV index: `index` alone, or the search window.
fn nv_candidates(index: Option<u32>) -> RangeInclusive<u32> {
    match index {
        Some(index) => index..=index,
        None => NV_INDEX_BASE..=NV_INDEX_BASE + (NV_INDEX_SEARCH - 1),
    }
}

fn hashing_algorithm(bank: PcrBanks) -> Option<HashingAlgorithm> {
    match bank {
        PcrBanks::SHA1 => Some(HashingAlgorithm::Sha1),
        PcrBanks::SHA256 => Some(HashingAlgorithm::Sha256),
        PcrBanks::SHA384 => Some(HashingAlgorithm::Sha384),
        PcrBanks::SHA512 => Some(HashingAlgorithm::Sha512),
        PcrBanks::SM3_256 => Some(HashingAlgorithm::Sm3_256),
        _ => None,
    }
}

const BANKS: [PcrBanks; 5] = [
    PcrBanks::SHA1,
    PcrBanks::SHA256,
    PcrBanks::SHA384,
    PcrBanks::SHA512,
    PcrBanks::SM3_256,
];

/// Every single bank selected in `banks`.
fn single_banks(banks: PcrBanks) -> impl Iterator<Item = PcrBanks> {
    BANKS.into_iter().filter(move |bank| banks.contains(*bank))
}

fn pcr_slots(pcrs: u32) -> BackendResult<Vec<PcrSlot>> {
    pcr_numbers(pcrs)
        .into_iter()
        .map(|pcr| PcrSlot::try_from(1u32 << pcr).map_err(backend_error))
        .collect()
}

fn selection_list(policy: NvPolicy) -> BackendResult<PcrSelectionList> {
    let slots = pcr_slots(policy.pcrs)?;
    let mut builder = PcrSelectionList::builder();
    for bank in single_banks(policy.banks) {
        let algorithm = hashing_algorithm(bank)
            .ok_or_else(|| BackendError::Failed(format!("unsupported PCR bank {bank}")))?;
        builder = builder.with_selection(algorithm, &slots);
    }
    builder.build().map_err(backend_error)
}

/// Connects to TPMs through the TCTI loader.
pub struct EsysConnector;

impl SecretStoreConnector for EsysConnector {
    fn connect(&self, tcti: Option<&Tcti>) -> BackendResult<Box<dyn SecretStore>> {
        let conf = match tcti {
            Some(tcti) => TctiNameConf::from_str(&tcti.to_string()),
            None => TctiNameConf::from_environment_variable(),
        }
        .map_err(backend_error)?;

        let ctx = TpmContext::new(conf).map_err(backend_error)?;
        Ok(Box::new(EsysStore { ctx }))
    }
}

pub struct EsysStore {
    ctx: TpmContext,
}

impl EsysStore {
    fn start_session(&mut self, session_type: SessionType) -> BackendResult<AuthSession> {
        self.ctx
            .start_auth_session(
                None,
                None,
                None,
                session_type,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )
            .map_err(backend_error)?
            .ok_or_else(|| BackendError::Failed("received invalid session handle".into()))
    }

    fn flush(&mut self, session: AuthSession) {
        if let Err(e) = self.ctx.flush_context(SessionHandle::from(session).into()) {
            log::debug!("Failed to flush policy session: {e}.");
        }
    }

    /// Run the policy commands for `policy` in `session`.
    fn apply_policy(
        &mut self,
        session: AuthSession,
        policy: NvPolicy,
        with_auth: bool,
    ) -> BackendResult<()> {
        let policy_session = PolicySession::try_from(session).map_err(backend_error)?;
        self.ctx
            .policy_pcr(policy_session, Digest::default(), selection_list(policy)?)
            .map_err(backend_error)?;
        if with_auth {
            self.ctx
                .policy_auth_value(policy_session)
                .map_err(backend_error)?;
        }
        Ok(())
    }

    /// Digest of `policy` over the current PCR values.
    fn policy_digest(&mut self, policy: NvPolicy, with_auth: bool) -> BackendResult<Digest> {
        let session = self.start_session(SessionType::Trial)?;
        let digest = self
            .apply_policy(session, policy, with_auth)
            .and_then(|()| {
                let policy_session = PolicySession::try_from(session).map_err(backend_error)?;
                self.ctx
                    .policy_get_digest(policy_session)
                    .map_err(backend_error)
            });
        self.flush(session);
        digest
    }

    fn nv_handle(&mut self, index: u32) -> BackendResult<NvIndexHandle> {
        let tpm_handle = NvIndexTpmHandle::new(index).map_err(backend_error)?;
        let object: ObjectHandle = self
            .ctx
            .execute_with_nullauth_session(|ctx| ctx.tr_from_tpm_public(TpmHandle::NvIndex(tpm_handle)))
            .map_err(backend_error)?;
        Ok(NvIndexHandle::from(object))
    }

    fn define(
        &mut self,
        index: u32,
        size: usize,
        auth: Option<&Auth>,
        digest: &Digest,
        da_protect: bool,
    ) -> tss_esapi::Result<NvIndexHandle> {
        let attributes = NvIndexAttributesBuilder::new()
            .with_owner_write(true)
            .with_policy_read(true)
            .with_no_da(!da_protect)
            .build()?;

        let public = NvPublicBuilder::new()
            .with_nv_index(NvIndexTpmHandle::new(index)?)
            .with_index_name_algorithm(HashingAlgorithm::Sha256)
            .with_index_attributes(attributes)
            .with_index_auth_policy(digest.clone())
            .with_data_area_size(size)
            .build()?;

        self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.nv_define_space(Provision::Owner, auth.cloned(), public)
        })
    }
}

impl SecretStore for EsysStore {
    fn supports_pcr_banks(&mut self, banks: PcrBanks, pcrs: u32) -> BackendResult<bool> {
        let (capability, _) = self
            .ctx
            .get_capability(CapabilityType::AssignedPcr, 0, 1)
            .map_err(backend_error)?;

        let CapabilityData::AssignedPcr(assigned) = capability else {
            return Err(BackendError::Failed("unexpected capability data".into()));
        };

        for bank in single_banks(banks) {
            let Some(algorithm) = hashing_algorithm(bank) else {
                return Ok(false);
            };

            let available = assigned
                .get_selections()
                .iter()
                .filter(|selection| selection.hashing_algorithm() == algorithm)
                .flat_map(|selection| selection.selected())
                .fold(0u32, |mask, slot| mask | u32::from(slot));

            if pcrs & !available != 0 {
                log::debug!("PCR bank {bank} lacks PCRs 0x{pcrs:08x}.");
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn get_random(&mut self, len: usize) -> BackendResult<Zeroizing<Vec<u8>>> {
        let mut random = Zeroizing::new(Vec::with_capacity(len));
        while random.len() < len {
            let chunk = RANDOM_CHUNK.min(len - random.len());
            let digest = self
                .ctx
                .execute_without_session(|ctx| ctx.get_random(chunk))
                .map_err(backend_error)?;
            random.extend_from_slice(digest.value());
        }
        random.truncate(len);
        Ok(random)
    }

    fn nv_define_and_write(
        &mut self,
        index: Option<u32>,
        data: &[u8],
        auth: Option<&[u8]>,
        policy: NvPolicy,
        da_protect: bool,
    ) -> BackendResult<u32> {
        let auth = auth
            .map(|auth| Auth::try_from(auth.to_vec()))
            .transpose()
            .map_err(backend_error)?;
        let digest = self.policy_digest(policy, auth.is_some())?;

        let mut defined = None;
        for candidate in nv_candidates(index) {
            match self.define(candidate, data.len(), auth.as_ref(), &digest, da_protect) {
                Ok(handle) => {
                    defined = Some((candidate, handle));
                    break;
                }
                Err(e) if index.is_none() && nv_defined(&e) => continue,
                Err(e) => return Err(backend_error(e)),
            }
        }
        let Some((index, handle)) = defined else {
            return Err(BackendError::Failed("no free NV index".into()));
        };
        log::debug!("Defined NV index 0x{index:08x}.");

        let buffer = MaxNvBuffer::try_from(data.to_vec()).map_err(backend_error)?;
        let written = self
            .ctx
            .execute_with_nullauth_session(|ctx| ctx.nv_write(NvAuth::Owner, handle, buffer, 0));
        if let Err(e) = written {
            if let Err(undo) = self.nv_undefine(index) {
                log::warn!("Failed to undefine NV index 0x{index:08x}: {undo}.");
            }
            return Err(backend_error(e));
        }

        Ok(index)
    }

    fn nv_read(
        &mut self,
        index: u32,
        auth: Option<&[u8]>,
        policy: NvPolicy,
        len: usize,
    ) -> BackendResult<Zeroizing<Vec<u8>>> {
        let size = u16::try_from(len)
            .map_err(|_| BackendError::Failed(format!("NV read of {len} bytes")))?;
        let handle = self.nv_handle(index)?;

        if let Some(auth) = auth {
            let auth = Auth::try_from(auth.to_vec()).map_err(backend_error)?;
            self.ctx
                .tr_set_auth(handle.into(), auth)
                .map_err(backend_error)?;
        }

        let session = self.start_session(SessionType::Policy)?;
        let data = self.apply_policy(session, policy, auth.is_some()).and_then(|()| {
            self.ctx
                .execute_with_session(Some(session), |ctx| {
                    ctx.nv_read(NvAuth::NvIndex(handle), handle, size, 0)
                })
                .map_err(backend_error)
        });
        self.flush(session);

        Ok(Zeroizing::new(data?.value().to_vec()))
    }

    fn nv_undefine(&mut self, index: u32) -> BackendResult<()> {
        let handle = self.nv_handle(index)?;
        self.ctx
            .execute_with_nullauth_session(|ctx| ctx.nv_undefine_space(Provision::Owner, handle))
            .map_err(backend_error)?;
        log::debug!("Undefined NV index 0x{index:08x}.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt1_error() {
        // TPM_RC_AUTH_FAIL for session 1
        assert_eq!(fmt1_error(0x98e), Some(RC_AUTH_FAIL));
        assert_eq!(fmt1_error(0x9a2), Some(RC_BAD_AUTH));
        assert_eq!(fmt1_error(RC_NV_DEFINED), None);
    }

    #[test]
    fn test_nv_candidates() {
        let explicit: Vec<u32> = nv_candidates(Some(u32::MAX)).collect();
        assert_eq!(explicit, vec![u32::MAX]);

        let search = nv_candidates(None);
        assert_eq!(*search.start(), NV_INDEX_BASE);
        assert_eq!(search.count(), NV_INDEX_SEARCH as usize);
    }

    #[test]
    fn test_single_banks() {
        let banks: Vec<PcrBanks> = single_banks(PcrBanks::SHA1 | PcrBanks::SHA384).collect();
        assert_eq!(banks, vec![PcrBanks::SHA1, PcrBanks::SHA384]);
        assert_eq!(hashing_algorithm(PcrBanks::SHA1 | PcrBanks::SHA256), None);
    }
}
