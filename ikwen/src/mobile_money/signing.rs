//! HMAC-SHA256 signatures of notification URLs.
//!
//! Operators post payment notifications to a URL we hand them at submission. The URL carries
//! a signature of the transaction id, so a notification for a transaction can only come from
//! someone who was given that URL.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::types::TransactionId;

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &str, transaction_id: &TransactionId) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(b"momo-notification.");
    mac.update(transaction_id.as_bytes());
    Some(mac)
}

/// URL-safe signature of a transaction id
pub fn sign_transaction(secret: &str, transaction_id: &TransactionId) -> Option<String> {
    let signature = mac(secret, transaction_id)?.finalize().into_bytes();
    Some(URL_SAFE_NO_PAD.encode(signature))
}

/// Check a signature in constant time
pub fn verify_transaction(secret: &str, transaction_id: &TransactionId, signature: &str) -> bool {
    let Ok(bytes) = URL_SAFE_NO_PAD.decode(signature) else {
        return false;
    };
    let Some(mac) = mac(secret, transaction_id) else {
        return false;
    };
    mac.verify_slice(&bytes).is_ok()
}

/// Where the operator notifies the final status of a transaction
pub fn notification_url(public_url: &str, provider: &str, secret: &str, transaction_id: &TransactionId) -> Option<String> {
    let signature = sign_transaction(secret, transaction_id)?;
    Some(format!(
        "{}/webhooks/mobile-money/{provider}/{transaction_id}?signature={signature}",
        public_url.trim_end_matches('/')
    ))
}
