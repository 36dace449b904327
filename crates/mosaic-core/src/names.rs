//! Display-name generation for fresh identities.
//!
//! Subjects are anonymous uuids; the generated name is the only
//! human-readable handle ever shown next to a pixel.

use rand::Rng;

const ADJECTIVES: [&str; 24] = [
    "Amber", "Bold", "Brisk", "Calm", "Coral", "Crimson", "Dapper", "Dusty", "Eager", "Fuzzy",
    "Gentle", "Jolly", "Keen", "Lucky", "Mellow", "Nimble", "Plucky", "Quiet", "Rusty", "Silent",
    "Swift", "Teal", "Witty", "Zesty",
];

const ANIMALS: [&str; 24] = [
    "Badger", "Bison", "Crane", "Dingo", "Falcon", "Gecko", "Heron", "Ibex", "Jackal", "Koala",
    "Lemur", "Lynx", "Marmot", "Narwhal", "Otter", "Panda", "Quokka", "Raven", "Seal", "Tapir",
    "Urchin", "Vole", "Walrus", "Yak",
];

/// Generates a random display name like `SwiftOtter42`.
#[must_use]
pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{}{}{}",
        ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())],
        ANIMALS[rng.gen_range(0..ANIMALS.len())],
        rng.gen_range(10..100)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_short_and_alphanumeric() {
        for _ in 0..50 {
            let name = generate();
            assert!(name.len() <= 24);
            assert!(name.chars().all(char::is_alphanumeric));
        }
    }
}
