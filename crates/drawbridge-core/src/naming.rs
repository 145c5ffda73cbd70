//! Human-readable device names.
//!
//! Freshly minted devices get an `adjective-animal` name so the fleet view
//! is readable. Collisions are arbitrated by the store's UNIQUE constraint;
//! callers retry on conflict.

use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "clever", "crimson", "daring", "dusky",
    "eager", "fleet", "gentle", "hidden", "keen", "lively", "mellow", "noble",
    "quiet", "rapid", "rustic", "silent", "swift", "vivid", "wandering", "witty",
];

const ANIMALS: &[&str] = &[
    "badger", "bison", "crane", "falcon", "ferret", "fox", "heron", "ibex",
    "jackal", "lemur", "lynx", "marmot", "marten", "otter", "owl", "panther",
    "puffin", "raven", "seal", "stoat", "swallow", "tapir", "viper", "wren",
];

/// Generate a random `adjective-animal` device name.
pub fn device_name() -> String {
    let mut rng = rand::rngs::OsRng;
    format!(
        "{}-{}",
        ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())],
        ANIMALS[rng.gen_range(0..ANIMALS.len())]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_has_two_parts() {
        let name = device_name();
        let parts: Vec<&str> = name.split('-').collect();
        assert_eq!(parts.len(), 2);
        assert!(ADJECTIVES.contains(&parts[0]));
        assert!(ANIMALS.contains(&parts[1]));
    }

    #[test]
    fn names_are_list_safe() {
        for _ in 0..32 {
            let name = device_name();
            assert!(crate::frame::validate_service_name(&name).is_ok());
        }
    }
}
