use rand::Rng;
use rand::rngs::OsRng;

use crate::error::SecretError;

/// Draw a random string of `length` printable ASCII characters, skipping
/// everything in `exclude`.
///
/// The exclusion set comes from the secret's declared policy: downstream
/// consumers' parsers cannot escape certain characters, and which ones
/// differ per consumer.
pub fn random_string(length: usize, exclude: &str) -> Result<String, SecretError> {
  // Printable ASCII including space; the policy trims from here.
  let alphabet: Vec<u8> = (0x20u8..=0x7e)
    .filter(|b| !exclude.as_bytes().contains(b))
    .collect();

  if alphabet.is_empty() {
    return Err(SecretError::InvalidPolicy {
      reason: "exclusion set leaves no characters to draw from".to_string(),
    });
  }

  let mut rng = OsRng;
  let value: String = (0..length)
    .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
    .collect();
  Ok(value)
}
