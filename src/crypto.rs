//! Secret-sharing and Schnorr arithmetic over secp256k1.
//!
//! Shares are scalars modulo the curve order, evaluated at a peer's seed. Public
//! images of shares (`share * G`) are combined with the same Lagrange weights as the
//! scalars themselves, so a group public key or an aggregate nonce point can be
//! rebuilt without anyone holding the aggregate secret.
use rand::RngCore;
use schnorr_fun::{nonce::Deterministic, Message, Schnorr, Signature};
use secp256kfun::{
    g,
    marker::{EvenY, NonZero, Normal, Public, Secret, Zero},
    s, Point, Scalar, G,
};
use sha2::{Digest, Sha256};

use crate::error::{MpcError, Result};

/// A scalar share (may be zero).
pub type Share = Scalar<Secret, Zero>;
/// A public point that may be the point at infinity.
pub type SharePoint = Point<Normal, Public, Zero>;

/// Length of a compressed point encoding.
pub const POINT_LEN: usize = 33;
/// Length of a provenance signature.
pub const SIGNATURE_LEN: usize = 64;

/// Application tag used for long-term provenance signatures.
const PROVENANCE_TAG: &str = "storeman-mpc";

/// Map a peer seed onto the scalar field.
pub fn seed_scalar(seed: u64) -> Result<Share> {
    let seed = u32::try_from(seed).map_err(|_| MpcError::MpcSeedOutRange(seed))?;
    if seed == 0 {
        return Err(MpcError::MpcSeedOutRange(0));
    }
    Ok(Scalar::from(seed))
}

/// Random polynomial `a_0 + a_1 x + ... + a_d x^d`.
#[derive(Clone, Debug)]
pub struct Polynomial {
    coefficients: Vec<Share>,
}

impl Polynomial {
    /// Sample a polynomial of `degree` with a random constant term (JRSS).
    pub fn random(degree: usize, rng: &mut impl RngCore) -> Self {
        let mut coefficients = Vec::with_capacity(degree + 1);
        for _ in 0..=degree {
            coefficients.push(Scalar::random(rng).mark_zero());
        }
        Polynomial { coefficients }
    }

    /// Sample a polynomial of `degree` whose constant term is zero (JZSS).
    pub fn random_zero(degree: usize, rng: &mut impl RngCore) -> Self {
        let mut poly = Self::random(degree, rng);
        poly.coefficients[0] = Scalar::zero();
        poly
    }

    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }

    pub fn secret(&self) -> &Share {
        &self.coefficients[0]
    }

    pub fn evaluate(&self, x: &Share) -> Share {
        let mut acc = Scalar::zero();
        for coefficient in self.coefficients.iter().rev() {
            acc = s!(acc * x + coefficient);
        }
        acc
    }

    /// Evaluate at a peer seed.
    pub fn evaluate_at_seed(&self, seed: u64) -> Result<Share> {
        Ok(self.evaluate(&seed_scalar(seed)?))
    }

    pub fn commitment(&self) -> Commitment {
        Commitment {
            points: self
                .coefficients
                .iter()
                .map(|coefficient| g!(coefficient * G).normalize())
                .collect(),
        }
    }
}

/// Public commitment `A_k = a_k * G` to a polynomial.
#[derive(Clone, Debug, PartialEq)]
pub struct Commitment {
    points: Vec<SharePoint>,
}

impl Commitment {
    pub fn points(&self) -> &[SharePoint] {
        &self.points
    }

    /// `sum(A_k * x^k)`, the public image of the committed polynomial at `x`.
    pub fn evaluate(&self, x: &Share) -> SharePoint {
        let mut acc = Point::zero();
        for point in self.points.iter().rev() {
            acc = g!(x * acc + point).normalize();
        }
        acc
    }

    /// Check that `share * G` matches the commitment evaluated at `seed`.
    pub fn verify_share(&self, seed: u64, share: &Share) -> Result<bool> {
        let x = seed_scalar(seed)?;
        Ok(g!(share * G).normalize() == self.evaluate(&x))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.points.len() * POINT_LEN);
        for point in &self.points {
            bytes.extend_from_slice(&encode_share_point(point));
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() || bytes.len() % POINT_LEN != 0 {
            return Err(MpcError::InvalidEncoding(format!(
                "commitment length {}",
                bytes.len()
            )));
        }
        let points = bytes
            .chunks(POINT_LEN)
            .map(decode_share_point)
            .collect::<Result<Vec<_>>>()?;
        Ok(Commitment { points })
    }
}

/// Lagrange weight of `x_j` for interpolation at zero over the set `xs`.
pub fn lagrange_coefficient(x_j: u64, xs: &[u64]) -> Result<Share> {
    let target = seed_scalar(x_j)?;
    let mut numerator = Scalar::one().mark_zero();
    let mut denominator = Scalar::one().mark_zero();
    for &x_m in xs.iter().filter(|&&x_m| x_m != x_j) {
        let x_m = seed_scalar(x_m)?;
        numerator = s!(numerator * x_m);
        denominator = s!(denominator * (x_m - target));
    }
    let denominator = denominator
        .non_zero()
        .ok_or_else(|| MpcError::InvalidEncoding("duplicate interpolation seed".into()))?;
    let inverse = denominator.invert();
    Ok(s!(numerator * inverse))
}

fn check_distinct(seeds: &[u64]) -> Result<()> {
    let mut sorted = seeds.to_vec();
    sorted.sort_unstable();
    if sorted.windows(2).any(|pair| pair[0] == pair[1]) {
        return Err(MpcError::MpcSeedDuplicate);
    }
    Ok(())
}

/// Interpolate scalar shares `(seed, value)` at zero.
pub fn lagrange_scalars(shares: &[(u64, Share)]) -> Result<Share> {
    let seeds: Vec<u64> = shares.iter().map(|(seed, _)| *seed).collect();
    check_distinct(&seeds)?;
    let mut acc = Scalar::zero();
    for (seed, value) in shares {
        let lambda = lagrange_coefficient(*seed, &seeds)?;
        acc = s!(acc + lambda * value);
    }
    Ok(acc)
}

/// Interpolate share points `(seed, value * G)` at zero.
pub fn lagrange_points(shares: &[(u64, SharePoint)]) -> Result<SharePoint> {
    let seeds: Vec<u64> = shares.iter().map(|(seed, _)| *seed).collect();
    check_distinct(&seeds)?;
    let mut acc = Point::zero();
    for (seed, point) in shares {
        let lambda = lagrange_coefficient(*seed, &seeds)?;
        acc = g!(acc + lambda * point).normalize();
    }
    Ok(acc)
}

/// Sum of points with equal weight.
#[cfg(test)]
pub fn sum_points<'a>(points: impl IntoIterator<Item = &'a SharePoint>) -> SharePoint {
    let mut acc = Point::zero();
    for point in points {
        acc = g!(acc + point).normalize();
    }
    acc
}

pub fn public_image(share: &Share) -> SharePoint {
    g!(share * G).normalize()
}

/// Compressed encoding; the point at infinity is 33 zero bytes.
pub fn encode_share_point(point: &SharePoint) -> [u8; POINT_LEN] {
    match point.non_zero() {
        Some(point) => point.to_bytes(),
        None => [0u8; POINT_LEN],
    }
}

pub fn decode_share_point(bytes: &[u8]) -> Result<SharePoint> {
    let bytes: [u8; POINT_LEN] = bytes
        .try_into()
        .map_err(|_| MpcError::InvalidEncoding(format!("point length {}", bytes.len())))?;
    if bytes == [0u8; POINT_LEN] {
        return Ok(Point::zero());
    }
    Point::<Normal, Public, NonZero>::from_bytes(bytes)
        .map(|point| point.mark_zero())
        .ok_or_else(|| MpcError::InvalidEncoding("point not on curve".into()))
}

/// Decode a point that must not be the point at infinity.
pub fn decode_point(bytes: &[u8]) -> Result<SharePoint> {
    let point = decode_share_point(bytes)?;
    if point.non_zero().is_none() {
        return Err(MpcError::PointZero);
    }
    Ok(point)
}

pub fn decode_scalar(bytes: &[u8]) -> Result<Share> {
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| MpcError::InvalidEncoding(format!("scalar length {}", bytes.len())))?;
    Scalar::from_bytes(bytes).ok_or_else(|| MpcError::InvalidEncoding("scalar overflow".into()))
}

pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Schnorr challenge `e = H(H(M) || R)`.
pub fn challenge(message: &[u8], r: &SharePoint) -> Share {
    let hashed_message = sha256(&[message]);
    let r_bytes = encode_share_point(r);
    Scalar::from_bytes_mod_order(sha256(&[&hashed_message, &r_bytes]))
}

/// This peer's share of `s = k + e * x`, optionally blinded by a zero-sharing share.
pub fn signature_share(private_share: &Share, nonce_share: &Share, e: &Share, blind: &Share) -> Share {
    s!(nonce_share + e * private_share + blind)
}

/// `s * G == R + e * Q` with `e = H(H(M) || R)`.
pub fn verify_signature(gpk: &SharePoint, r: &SharePoint, s: &Share, message: &[u8]) -> bool {
    if gpk.non_zero().is_none() || r.non_zero().is_none() {
        return false;
    }
    let e = challenge(message, r);
    g!(s * G).normalize() == g!(r + e * gpk).normalize()
}

/// Recovery parity of `R`: bit 0 is y-odd, bit 1 is set when `x >= n`.
pub fn recovery_parity(r: &SharePoint) -> Result<u8> {
    let bytes = r.non_zero().ok_or(MpcError::PointZero)?.to_bytes();
    let mut x = [0u8; 32];
    x.copy_from_slice(&bytes[1..]);
    let mut v = if Scalar::<Public, Zero>::from_bytes(x).is_some() { 0 } else { 2 };
    if bytes[0] == 0x03 {
        v |= 1;
    }
    Ok(v)
}

/// Twenty-byte account address bound to a group public key.
pub fn address_of(gpk: &[u8]) -> [u8; 20] {
    let digest = sha256(&[gpk]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&digest[12..]);
    address
}

/// Long-term key signatures proving who produced a share or point.
#[derive(Clone)]
pub struct Provenance {
    schnorr: Schnorr<Sha256, Deterministic<Sha256>>,
}

impl Default for Provenance {
    fn default() -> Self {
        Provenance {
            schnorr: Schnorr::<Sha256, Deterministic<Sha256>>::new(
                Deterministic::<Sha256>::default(),
            ),
        }
    }
}

impl Provenance {
    pub fn public_key(&self, secret: &Scalar) -> Point<EvenY> {
        self.schnorr.new_keypair(secret.clone()).public_key()
    }

    pub fn sign(&self, secret: &Scalar, digest: &[u8; 32]) -> [u8; SIGNATURE_LEN] {
        let keypair = self.schnorr.new_keypair(secret.clone());
        self.schnorr
            .sign(&keypair, Message::<Public>::plain(PROVENANCE_TAG, digest))
            .to_bytes()
    }

    pub fn verify(&self, public_key: &Point<EvenY>, digest: &[u8; 32], signature: &[u8]) -> bool {
        let signature: [u8; SIGNATURE_LEN] = match signature.try_into() {
            Ok(signature) => signature,
            Err(_) => return false,
        };
        match Signature::from_bytes(signature) {
            Some(signature) => self.schnorr.verify(
                public_key,
                Message::<Public>::plain(PROVENANCE_TAG, digest),
                &signature,
            ),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256kfun::proptest::{
        prelude::*,
        test_runner::{RngAlgorithm, TestRng},
    };

    fn joint_sharing(
        threshold: usize,
        seeds: &[u64],
        rng: &mut TestRng,
    ) -> (Vec<Polynomial>, Vec<(u64, Share)>) {
        let polys: Vec<_> = seeds
            .iter()
            .map(|_| Polynomial::random(threshold - 1, rng))
            .collect();
        let shares = seeds
            .iter()
            .map(|seed| {
                let mut total = Scalar::zero();
                for poly in &polys {
                    let value = poly.evaluate_at_seed(*seed).unwrap();
                    total = s!(total + value);
                }
                (*seed, total)
            })
            .collect();
        (polys, shares)
    }

    #[test]
    fn zero_polynomial_has_zero_secret() {
        let mut rng = TestRng::deterministic_rng(RngAlgorithm::ChaCha);
        let poly = Polynomial::random_zero(3, &mut rng);
        assert_eq!(poly.degree(), 3);
        assert_eq!(poly.evaluate(&Scalar::zero()), Scalar::<Public, Zero>::zero());
        assert_eq!(
            encode_share_point(&poly.commitment().points()[0]),
            [0u8; POINT_LEN]
        );
    }

    #[test]
    fn commitment_round_trips_through_bytes() {
        let mut rng = TestRng::deterministic_rng(RngAlgorithm::ChaCha);
        let poly = Polynomial::random_zero(2, &mut rng);
        let commitment = poly.commitment();
        let decoded = Commitment::from_bytes(&commitment.to_bytes()).unwrap();
        assert_eq!(decoded, commitment);
        assert!(Commitment::from_bytes(&[1u8; 10]).is_err());
    }

    #[test]
    fn share_matches_commitment() {
        let mut rng = TestRng::deterministic_rng(RngAlgorithm::ChaCha);
        let poly = Polynomial::random(2, &mut rng);
        let commitment = poly.commitment();
        let share = poly.evaluate_at_seed(42).unwrap();
        assert!(commitment.verify_share(42, &share).unwrap());
        assert!(!commitment.verify_share(43, &share).unwrap());
        let bogus = Scalar::random(&mut rng).mark_zero();
        assert!(!commitment.verify_share(42, &bogus).unwrap());
    }

    #[test]
    fn seed_zero_and_oversized_are_rejected() {
        assert_eq!(seed_scalar(0), Err(MpcError::MpcSeedOutRange(0)));
        assert!(seed_scalar(u64::MAX).is_err());
        assert_eq!(
            lagrange_scalars(&[(3, Scalar::zero()), (3, Scalar::zero())]),
            Err(MpcError::MpcSeedDuplicate)
        );
    }

    #[test]
    fn point_interpolation_matches_constant_term_sum() {
        let mut rng = TestRng::deterministic_rng(RngAlgorithm::ChaCha);
        let seeds = [11u64, 22, 33, 44];
        let (polys, shares) = joint_sharing(3, &seeds, &mut rng);
        let points: Vec<_> = shares
            .iter()
            .map(|(seed, share)| (*seed, public_image(share)))
            .collect();
        let interpolated = lagrange_points(&points).unwrap();
        let constant_terms: Vec<_> = polys
            .iter()
            .map(|poly| poly.commitment().points()[0])
            .collect();
        assert_eq!(interpolated, sum_points(&constant_terms));
    }

    #[test]
    fn threshold_signature_verifies() {
        let mut rng = TestRng::deterministic_rng(RngAlgorithm::ChaCha);
        let seeds = [5u64, 9, 17, 200];
        let (_, key_shares) = joint_sharing(3, &seeds, &mut rng);
        let (_, nonce_shares) = joint_sharing(3, &seeds, &mut rng);
        let gpk = public_image(&lagrange_scalars(&key_shares).unwrap());
        let r = lagrange_points(
            &nonce_shares
                .iter()
                .map(|(seed, k)| (*seed, public_image(k)))
                .collect::<Vec<_>>(),
        )
        .unwrap();
        let message = b"transfer 10";
        let e = challenge(message, &r);
        let s_shares: Vec<_> = key_shares
            .iter()
            .zip(&nonce_shares)
            .map(|((seed, x), (_, k))| (*seed, signature_share(x, k, &e, &Scalar::zero())))
            .collect();
        let s = lagrange_scalars(&s_shares[..3]).unwrap();
        assert!(verify_signature(&gpk, &r, &s, message));
        assert!(!verify_signature(&gpk, &r, &s, b"transfer 11"));
        assert!(recovery_parity(&r).unwrap() <= 1);
    }

    #[test]
    fn provenance_signature_binds_digest_and_key() {
        let mut rng = TestRng::deterministic_rng(RngAlgorithm::ChaCha);
        let provenance = Provenance::default();
        let secret = Scalar::random(&mut rng);
        let other = Scalar::random(&mut rng);
        let digest = sha256(&[b"share"]);
        let signature = provenance.sign(&secret, &digest);
        assert!(provenance.verify(&provenance.public_key(&secret), &digest, &signature));
        assert!(!provenance.verify(&provenance.public_key(&other), &digest, &signature));
        assert!(!provenance.verify(
            &provenance.public_key(&secret),
            &sha256(&[b"other"]),
            &signature
        ));
        assert!(!provenance.verify(&provenance.public_key(&secret), &digest, &signature[..10]));
    }

    proptest! {
        #[test]
        fn any_threshold_subset_reconstructs_the_secret(
            (threshold, n_parties) in (1usize..4).prop_flat_map(|t| (Just(t), (2 * t + 1)..(2 * t + 3)))
        ) {
            let mut rng = TestRng::deterministic_rng(RngAlgorithm::ChaCha);
            let seeds: Vec<u64> = (1..=n_parties as u64).map(|i| i * 7919).collect();
            let (polys, mut shares) = joint_sharing(threshold + 1, &seeds, &mut rng);

            let mut secret = Scalar::zero();
            for poly in &polys {
                let constant = poly.secret();
                secret = s!(secret + constant);
            }

            shares.rotate_left(n_parties / 2);
            let subset = &shares[..threshold + 1];
            let reconstructed = lagrange_scalars(subset).unwrap();
            prop_assert_eq!(&reconstructed, &secret);

            let points: Vec<_> = shares.iter().map(|(seed, share)| (*seed, public_image(share))).collect();
            prop_assert_eq!(lagrange_points(&points).unwrap(), public_image(&secret));
        }
    }
}
