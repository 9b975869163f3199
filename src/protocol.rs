//! Step sequences of the key generation and signing protocols.
//!
//! Leader and follower sequences line up step for step, so a message stamped with
//! step id `i` on one side is handled by step `i` on the other.
use crate::message::RunRequest;
use crate::slash::SharePurpose;
use crate::step::{
    AckGpkStep, AckRsStep, AcknowledgeStep, CalSignStep, GetReadyStep, JudgeStep, LagrangeStep,
    PointStep, ReadyStep, RequestStep, ShareStep, Step,
};

/// Step id of the key sharing round of a key generation run.
pub const KEYGEN_KEY_SHARE_STEP: usize = 2;
/// Step id of the nonce sharing round of a signing run.
pub const SIGN_NONCE_SHARE_STEP: usize = 2;
/// Step id of the round publishing R shares.
pub const SIGN_R_POINT_STEP: usize = 4;

fn opening(leader: bool, request: &RunRequest, total: usize) -> Vec<Step> {
    if leader {
        vec![
            Step::Request(RequestStep::new(request.clone(), total)),
            Step::Ready(ReadyStep::new()),
        ]
    } else {
        vec![
            Step::Acknowledge(AcknowledgeStep::new()),
            Step::GetReady(GetReadyStep::new()),
        ]
    }
}

pub fn key_generation_steps(leader: bool, request: &RunRequest, total: usize) -> Vec<Step> {
    let mut steps = opening(leader, request, total);
    steps.extend([
        Step::Share(ShareStep::new(SharePurpose::KeyShare, 1, total)),
        Step::Point(PointStep::new(SharePurpose::KeyShare, 1, total)),
        Step::Judge(JudgeStep::new()),
        Step::AckGpk(AckGpkStep::new(total)),
    ]);
    steps
}

pub fn signing_steps(leader: bool, request: &RunRequest, total: usize) -> Vec<Step> {
    let count = request.sign_count;
    let mut steps = opening(leader, request, total);
    steps.extend([
        Step::Share(ShareStep::new(SharePurpose::Nonce, count, total)),
        Step::Share(ShareStep::new(SharePurpose::Blind, count, total)),
        Step::Point(PointStep::new(SharePurpose::Nonce, count, total)),
        Step::Judge(JudgeStep::new()),
        Step::Lagrange(LagrangeStep::new(count, total)),
        Step::CalSign(CalSignStep::new(count)),
        Step::AckRs(AckRsStep::new(count, total)),
    ]);
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ProtocolKind;
    use crate::step::StepLogic;

    fn names(steps: &[Step]) -> Vec<&'static str> {
        steps.iter().map(|s| s.name()).collect()
    }

    #[test]
    fn leader_and_follower_sequences_line_up() {
        let request = RunRequest {
            kind: ProtocolKind::Sign,
            group_id: "grp0".into(),
            gpk: vec![],
            message: b"transfer 10".to_vec(),
            sign_count: 2,
            address: vec![],
        };
        let leader = signing_steps(true, &request, 4);
        let follower = signing_steps(false, &request, 4);
        assert_eq!(leader.len(), follower.len());
        assert_eq!(names(&leader)[2..], names(&follower)[2..]);
        assert_eq!(names(&leader)[SIGN_NONCE_SHARE_STEP], "nonce-share");
        assert_eq!(names(&leader)[SIGN_R_POINT_STEP], "nonce-point");
        assert_eq!(names(&follower)[..2], ["acknowledge", "get-ready"]);

        let keygen = key_generation_steps(true, &request, 4);
        assert_eq!(
            names(&keygen),
            ["request", "ready", "key-share", "gpk-point", "judge", "ack-gpk"]
        );
        assert_eq!(names(&keygen)[KEYGEN_KEY_SHARE_STEP], "key-share");
    }
}
