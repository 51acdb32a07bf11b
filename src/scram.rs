//! SCRAM-SHA-256 authentication (RFC 5802, RFC 7677).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 18;

#[derive(Debug, Clone, Error)]
pub enum ScramError {
    #[error("malformed server message")]
    MalformedServerMessage,
    #[error("server message missing attribute '{0}'")]
    MissingAttribute(char),
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("server signature verification failed")]
    BadServerSignature,
    #[error("handshake step out of order")]
    OutOfOrder,
}

/// Client side of a SCRAM-SHA-256 exchange.
///
/// Drive it in order: `client_first_message`, `process_server_first`,
/// `verify_server_final`.
pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,
    // populated by process_server_first
    auth_message: Option<String>,
    salted_password: Option<[u8; 32]>,
}

impl ScramClient {
    pub fn new(username: &str, password: &str) -> Self {
        let nonce_bytes: [u8; NONCE_LEN] = rand::thread_rng().gen();
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: BASE64.encode(nonce_bytes),
            auth_message: None,
            salted_password: None,
        }
    }

    /// The client-first-message: `n,,n=<user>,r=<nonce>`.
    ///
    /// PostgreSQL ignores the SASL username (it comes from the startup
    /// packet), so no SASLprep normalization is applied here.
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    /// Consume the server-first-message and produce the
    /// client-final-message carrying the proof.
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, ScramError> {
        let server_first = std::str::from_utf8(server_msg)
            .map_err(|_| ScramError::MalformedServerMessage)?
            .to_string();

        let nonce = attribute(&server_first, 'r')?;
        let salt = BASE64
            .decode(attribute(&server_first, 's')?)
            .map_err(|_| ScramError::MalformedServerMessage)?;
        let iterations: u32 = attribute(&server_first, 'i')?
            .parse()
            .map_err(|_| ScramError::MalformedServerMessage)?;

        if !nonce.starts_with(&self.client_nonce) || nonce.len() <= self.client_nonce.len() {
            return Err(ScramError::NonceMismatch);
        }

        let salted_password = salt_password(&self.password, &salt, iterations);
        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key = Sha256::digest(client_key);

        let without_proof = format!("c=biws,r={}", nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            without_proof
        );

        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(client_signature.iter()) {
            *p ^= s;
        }

        self.auth_message = Some(auth_message);
        self.salted_password = Some(salted_password);

        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check the server-final-message signature.
    pub fn verify_server_final(&self, server_msg: &[u8]) -> Result<(), ScramError> {
        let text =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::MalformedServerMessage)?;
        let verifier = BASE64
            .decode(attribute(text, 'v')?)
            .map_err(|_| ScramError::MalformedServerMessage)?;

        let salted_password = self.salted_password.ok_or(ScramError::OutOfOrder)?;
        let auth_message = self.auth_message.as_ref().ok_or(ScramError::OutOfOrder)?;

        let server_key = hmac(&salted_password, b"Server Key");
        let expected = hmac(&server_key, auth_message.as_bytes());

        if verifier != expected {
            return Err(ScramError::BadServerSignature);
        }
        Ok(())
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", self.username, self.client_nonce)
    }
}

/// Extract a `<key>=<value>` attribute from a comma-separated SCRAM message.
fn attribute(message: &str, key: char) -> Result<&str, ScramError> {
    message
        .split(',')
        .find(|part| part.as_bytes().first() == Some(&(key as u8)) && part[1..].starts_with('='))
        .map(|part| &part[2..])
        .ok_or(ScramError::MissingAttribute(key))
}

/// Hi(): PBKDF2 with HMAC-SHA-256.
fn salt_password(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut out)
        .expect("32-byte output is always valid");
    out
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_shape() {
        let mut client = ScramClient::new("user", "pencil");

        let first = String::from_utf8(client.client_first_message()).unwrap();
        assert!(first.starts_with("n,,n=user,r="));

        let client_nonce = first.strip_prefix("n,,n=user,r=").unwrap().to_string();
        let server_first = format!(
            "r={}extension,s={},i=4096",
            client_nonce,
            BASE64.encode(b"salt1234salt1234")
        );

        let final_msg =
            String::from_utf8(client.process_server_first(server_first.as_bytes()).unwrap())
                .unwrap();
        assert!(final_msg.starts_with(&format!("c=biws,r={}extension,p=", client_nonce)));
    }

    #[test]
    fn server_nonce_must_extend_client_nonce() {
        let mut client = ScramClient::new("user", "pw");
        let server_first = format!("r=somebodyelse,s={},i=4096", BASE64.encode(b"saltsalt"));
        assert!(matches!(
            client.process_server_first(server_first.as_bytes()),
            Err(ScramError::NonceMismatch)
        ));
    }

    #[test]
    fn missing_attribute_rejected() {
        let mut client = ScramClient::new("user", "pw");
        assert!(matches!(
            client.process_server_first(b"s=AAAA,i=4096"),
            Err(ScramError::MissingAttribute('r'))
        ));
    }

    #[test]
    fn verify_before_first_message_is_out_of_order() {
        let client = ScramClient::new("user", "pw");
        assert!(matches!(
            client.verify_server_final(b"v=AAAA"),
            Err(ScramError::OutOfOrder)
        ));
    }
}
