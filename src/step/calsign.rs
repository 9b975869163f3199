//! Compose the final signatures locally.
use tracing::info;

use super::{RunInfo, StepBase, StepLogic};
use crate::crypto::{address_of, decode_point, recovery_parity};
use crate::error::{MpcError, Result};
use crate::message::StepMessage;
use crate::store::{indexed_key, keys, ResultStore};

pub struct CalSignStep {
    base: StepBase,
    count: usize,
}

impl CalSignStep {
    pub fn new(count: usize) -> Self {
        CalSignStep {
            base: StepBase::new(0),
            count,
        }
    }
}

impl StepLogic for CalSignStep {
    fn name(&self) -> &'static str {
        "calsign"
    }

    fn init(&mut self, _info: &RunInfo, store: &ResultStore) -> Result<()> {
        store.get_bytes(keys::GPK)?;
        for ordinal in 0..self.count {
            store.get_bytes(&indexed_key(keys::R, ordinal))?;
            store.get_scalar(&indexed_key(keys::S, ordinal))?;
        }
        Ok(())
    }

    fn create_messages(&mut self, _info: &RunInfo) -> Result<Vec<StepMessage>> {
        Ok(vec![])
    }

    fn handle_message(&mut self, _info: &RunInfo, _message: &StepMessage) -> bool {
        false
    }

    fn finish(&mut self, info: &RunInfo, store: &mut ResultStore) -> Result<()> {
        self.base.close(self.name())?;
        if store.has_bytes(keys::ADDRESS) {
            let expected = store.get_bytes(keys::ADDRESS)?;
            if address_of(store.get_bytes(keys::GPK)?)[..] != *expected {
                return Err(MpcError::FailSignRetVerify);
            }
        }
        for ordinal in 0..self.count {
            let r_bytes = store.get_bytes(&indexed_key(keys::R, ordinal))?.to_vec();
            let s = store.get_scalar(&indexed_key(keys::S, ordinal))?.clone();
            let v = recovery_parity(&decode_point(&r_bytes)?)?;

            let mut signature = r_bytes;
            signature.extend_from_slice(&s.to_bytes());
            store.set_bytes(indexed_key(keys::SIGNATURE, ordinal), signature);
            store.set_bytes(indexed_key(keys::V, ordinal), vec![v]);
        }
        info!(run_id = info.run_id, count = self.count, "signatures composed");
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.base.is_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{encode_share_point, public_image};
    use crate::message::ProtocolKind;
    use crate::step::tests::test_run;
    use secp256kfun::Scalar;

    fn signed_store() -> ResultStore {
        let mut store = ResultStore::new();
        let gpk = encode_share_point(&public_image(&Scalar::from(3u32)));
        store.set_bytes(keys::GPK, gpk.to_vec());
        store.set_bytes(
            indexed_key(keys::R, 0),
            encode_share_point(&public_image(&Scalar::from(11u32))).to_vec(),
        );
        store.set_scalar(indexed_key(keys::S, 0), Scalar::from(42u32));
        store
    }

    #[test]
    fn composes_r_and_s() {
        let infos = test_run(ProtocolKind::Sign);
        let mut store = signed_store();
        let mut step = CalSignStep::new(1);
        step.init(&infos[0], &store).unwrap();
        assert!(step.is_complete());
        step.finish(&infos[0], &mut store).unwrap();
        let signature = store.get_bytes(&indexed_key(keys::SIGNATURE, 0)).unwrap();
        assert_eq!(signature.len(), 65);
        assert_eq!(signature[64], 42);
        assert!(store.get_bytes(&indexed_key(keys::V, 0)).unwrap()[0] <= 1);
    }

    #[test]
    fn wrong_address_fails() {
        let infos = test_run(ProtocolKind::Sign);
        let mut store = signed_store();
        store.set_bytes(keys::ADDRESS, vec![0u8; 20]);
        let mut step = CalSignStep::new(1);
        step.init(&infos[0], &store).unwrap();
        assert_eq!(
            step.finish(&infos[0], &mut store),
            Err(MpcError::FailSignRetVerify)
        );

        let mut store = signed_store();
        let address = address_of(store.get_bytes(keys::GPK).unwrap());
        store.set_bytes(keys::ADDRESS, address.to_vec());
        let mut step = CalSignStep::new(1);
        assert_eq!(step.finish(&infos[0], &mut store), Ok(()));
    }

    #[test]
    fn missing_s_is_reported() {
        let infos = test_run(ProtocolKind::Sign);
        let mut store = signed_store();
        store.set_scalars(indexed_key(keys::S, 0), vec![]);
        let mut step = CalSignStep::new(2);
        assert!(matches!(
            step.init(&infos[0], &store),
            Err(MpcError::KeyNotFound(_))
        ));
    }
}
