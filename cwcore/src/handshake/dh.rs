use super::utils::{HandshakeError, Result};
use num_bigint::BigUint;
use num_traits::One;
use rand::RngCore;

/// Default modulus of the signaling handshake, shared with deployed peers.
pub const DEFAULT_MODULUS_HEX: &str = "C71CAEB9C6B1C9048E6C522F70F13F73980D40238E3E21C14934D037563D930F48198A0AA7C14058229493D22530F4DBFA336F6E0AC925139543A94464314C7F2012519CE6DE5BF3ADBD63796D41780160830B75F3A90248238F76953D64AF663004013B9F8D1768822610B71311531E83FA79715DAF63";
pub const DEFAULT_GENERATOR: u32 = 3;

pub const MIN_MODULUS_BITS: u64 = 768;
pub const MAX_MODULUS_BITS: u64 = 4096;
pub const MIN_GENERATOR: u32 = 2;
pub const MAX_GENERATOR: u32 = 7;
pub const PRIVATE_EXPONENT_BITS: usize = 256;

/// Validated Diffie-Hellman group parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhParams {
    modulus: BigUint,
    generator: BigUint,
}

impl Default for DhParams {
    fn default() -> Self {
        let modulus = BigUint::parse_bytes(DEFAULT_MODULUS_HEX.as_bytes(), 16)
            .unwrap_or_else(|| unreachable!("default modulus is valid hex"));
        Self {
            modulus,
            generator: BigUint::from(DEFAULT_GENERATOR),
        }
    }
}

impl DhParams {
    /// Accepts parameters only inside the protocol bounds: an odd modulus of
    /// 768..=4096 bits and a generator in 2..=7.
    pub fn new(modulus: BigUint, generator: BigUint) -> Result<Self> {
        let bits = modulus.bits();
        if !(MIN_MODULUS_BITS..=MAX_MODULUS_BITS).contains(&bits) {
            return Err(HandshakeError::InvalidParams(format!(
                "modulus is {bits} bits, expected {MIN_MODULUS_BITS}..={MAX_MODULUS_BITS}"
            )));
        }
        if !modulus.bit(0) {
            return Err(HandshakeError::InvalidParams("modulus is even".into()));
        }
        let g_ok = generator >= BigUint::from(MIN_GENERATOR)
            && generator <= BigUint::from(MAX_GENERATOR)
            && generator < modulus;
        if !g_ok {
            return Err(HandshakeError::InvalidParams(format!(
                "generator {generator} outside {MIN_GENERATOR}..={MAX_GENERATOR}"
            )));
        }
        Ok(Self { modulus, generator })
    }

    pub fn modulus(&self) -> &BigUint {
        &self.modulus
    }

    pub fn generator(&self) -> &BigUint {
        &self.generator
    }

    /// Draws a uniformly random exponent of [`PRIVATE_EXPONENT_BITS`] bits in `[2, p - 2]`.
    pub fn generate_private_exponent(&self) -> BigUint {
        let upper = &self.modulus - 2u32;
        let mut bytes = [0u8; PRIVATE_EXPONENT_BITS / 8];
        loop {
            rand::rng().fill_bytes(&mut bytes);
            let candidate = BigUint::from_bytes_be(&bytes);
            if candidate >= BigUint::from(2u32) && candidate <= upper {
                return candidate;
            }
        }
    }

    pub fn public_value(&self, exponent: &BigUint) -> BigUint {
        self.generator.modpow(exponent, &self.modulus)
    }

    /// Rejects degenerate public values (`y <= 1` or `y >= p - 1`).
    pub fn check_public(&self, value: &BigUint) -> Result<()> {
        let upper = &self.modulus - BigUint::one();
        if value <= &BigUint::one() || value >= &upper {
            return Err(HandshakeError::InvalidParams(
                "public value outside (1, p - 1)".into(),
            ));
        }
        Ok(())
    }

    pub fn shared_secret(&self, peer_public: &BigUint, exponent: &BigUint) -> Result<BigUint> {
        self.check_public(peer_public)?;
        Ok(peer_public.modpow(exponent, &self.modulus))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_are_within_bounds() {
        let params = DhParams::default();
        assert!(DhParams::new(params.modulus().clone(), params.generator().clone()).is_ok());
        assert_eq!(params.modulus().bits(), 952);
    }

    #[test]
    fn test_rejects_small_modulus() {
        let err = DhParams::new(BigUint::from(23u32), BigUint::from(5u32)).unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidParams(_)));
    }

    #[test]
    fn test_rejects_generator_out_of_range() {
        let modulus = DhParams::default().modulus().clone();
        assert!(DhParams::new(modulus.clone(), BigUint::from(1u32)).is_err());
        assert!(DhParams::new(modulus, BigUint::from(11u32)).is_err());
    }

    #[test]
    fn test_rejects_degenerate_public_values() {
        let params = DhParams::default();
        let p_minus_one = params.modulus() - 1u32;
        assert!(params.check_public(&BigUint::one()).is_err());
        assert!(params.check_public(&p_minus_one).is_err());
        assert!(params.check_public(&BigUint::from(12345u32)).is_ok());
    }

    #[test]
    fn test_shared_secret_agrees() {
        let params = DhParams::default();
        let a = params.generate_private_exponent();
        let b = params.generate_private_exponent();
        let ga = params.public_value(&a);
        let gb = params.public_value(&b);
        assert_eq!(
            params.shared_secret(&gb, &a).unwrap(),
            params.shared_secret(&ga, &b).unwrap()
        );
    }
}
