use md5::{Digest, Md5};

/// Deterministic gravatar-style avatar URL from an email address.
/// Pure function: same email and size always yield the same URL.
pub fn avatar_url(email: &str, size: u32) -> String {
    let normalized = email.trim().to_lowercase();
    let digest = Md5::digest(normalized.as_bytes());
    format!(
        "https://www.gravatar.com/avatar/{}?s={}&d=mm",
        hex::encode(digest),
        size
    )
}

/// Size used for avatars assigned at signup.
pub const SIGNUP_AVATAR_SIZE: u32 = 100;
