//! The session state machine.
//!
//! A [`Session`] owns the persistent data of one activation and dispatches
//! every protocol operation: the activation handshake, request signing,
//! status decoding, vault operations, protocol upgrade and recovery access.
//! The object is single-owner; the caller serializes access and persists
//! the state blob after mutating operations.
//!
//! State model: a session is `Empty`, `PendingActivation` (ephemeral, never
//! serialized) or `Activated`, optionally with an upgrade in progress.

use crate::activation::{
    self, ActivationKeys, PendingActivation, StartActivationParam, StartActivationResult,
    ValidateActivationResponseParam, ValidateActivationResponseResult,
};
use crate::code;
use crate::counter::{ProtocolVersion, SignatureCounter, CTR_DATA_LEN};
use crate::crypto::{self, SessionRng};
use crate::ecies::{EciesEncryptor, EciesEncryptorScope};
use crate::error::{Error, Result};
use crate::factors::{
    self, SignatureFactor, SignatureKeysBlob, SignatureUnlockKeys, PBKDF2_SALT_LEN,
};
use crate::memory::{SecretKey, KEY_LEN};
use crate::password::Password;
use crate::persistence::{self, PersistentData, RecoveryData};
use crate::signature::{
    self, HttpRequestData, HttpRequestDataSignature, NONCE_LEN,
};
use crate::status::{self, ActivationStatus, EncryptedActivationStatus};
use crate::vault;
use data_encoding::BASE64;

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

/// Immutable per-application configuration provided at construction.
#[derive(Clone, Debug)]
pub struct SessionSetup {
    /// Application key, Base64 of 16 bytes. Travels in signature headers.
    pub application_key: String,
    /// Application secret, Base64 of 16 bytes. Enters signature
    /// normalization and the state-blob integrity key.
    pub application_secret: String,
    /// Master server public key, Base64 SEC1.
    pub master_server_public_key: String,
    /// Optional external encryption key adding one more wrap layer around
    /// every factor key.
    pub external_encryption_key: Option<SecretKey>,
}

/// Server key selector for [`Session::verify_server_signed_data`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SigningKey {
    /// The master server key from the setup.
    MasterServer,
    /// The personalized server key established by the activation.
    PersonalizedServer,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Long-lived session between a device and the authentication server.
pub struct Session {
    setup: SessionSetup,
    /// Decoded application secret, kept for integrity-key derivation.
    application_secret_bytes: SecretKey,
    /// Decoded master server public key.
    master_server_public_key: Vec<u8>,
    /// Runtime EEK; seeded from the setup, replaceable at runtime.
    eek: Option<SecretKey>,
    data: Option<PersistentData>,
    pending: Option<PendingActivation>,
    rng: Box<dyn SessionRng>,
}

impl Session {
    /// Create a session from a validated setup and an injected random
    /// generator.
    pub fn new(setup: SessionSetup, rng: Box<dyn SessionRng>) -> Result<Self> {
        let application_key = BASE64
            .decode(setup.application_key.as_bytes())
            .map_err(|_| Error::WrongSetup("application key is not valid Base64".into()))?;
        if application_key.len() != KEY_LEN {
            return Err(Error::WrongSetup("application key must be 16 bytes".into()));
        }
        let application_secret = BASE64
            .decode(setup.application_secret.as_bytes())
            .map_err(|_| Error::WrongSetup("application secret is not valid Base64".into()))?;
        let application_secret_bytes = SecretKey::from_slice(&application_secret)
            .ok_or_else(|| Error::WrongSetup("application secret must be 16 bytes".into()))?;
        let master_server_public_key = BASE64
            .decode(setup.master_server_public_key.as_bytes())
            .map_err(|_| Error::WrongSetup("master server public key is not valid Base64".into()))?;
        crypto::validate_public_key(&master_server_public_key)
            .map_err(|_| Error::WrongSetup("master server public key is not a valid point".into()))?;
        if let Some(ref eek) = setup.external_encryption_key {
            if eek.is_zero() {
                return Err(Error::WrongSetup("external encryption key is zero-filled".into()));
            }
        }
        let eek = setup.external_encryption_key.clone();
        Ok(Self {
            setup,
            application_secret_bytes,
            master_server_public_key,
            eek,
            data: None,
            pending: None,
            rng,
        })
    }

    /// Discard any pending activation and activated state. Setup and EEK
    /// survive.
    pub fn reset(&mut self) {
        self.data = None;
        self.pending = None;
    }

    // -- State queries ------------------------------------------------------

    /// `true` when a new activation may start.
    #[must_use]
    pub fn can_start_activation(&self) -> bool {
        self.data.is_none() && self.pending.is_none()
    }

    /// `true` while an activation handshake is in progress.
    #[must_use]
    pub fn has_pending_activation(&self) -> bool {
        self.pending.is_some()
    }

    /// `true` when the session holds a completed activation.
    #[must_use]
    pub fn has_valid_activation(&self) -> bool {
        self.data.is_some()
    }

    /// `true` while a protocol upgrade is in progress.
    #[must_use]
    pub fn has_pending_protocol_upgrade(&self) -> bool {
        self.data
            .as_ref()
            .is_some_and(|data| data.pending_upgrade_version.is_some())
    }

    /// Protocol version the session operates in; the newest supported
    /// version when there is no activation.
    #[must_use]
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.data
            .as_ref()
            .map_or(ProtocolVersion::latest(), |data| data.protocol_version)
    }

    /// Activation identifier of a completed activation.
    #[must_use]
    pub fn activation_identifier(&self) -> Option<&str> {
        self.data.as_ref().map(|data| data.activation_id.as_str())
    }

    /// Recompute the visual fingerprint of a completed activation.
    pub fn activation_fingerprint(&self) -> Result<String> {
        let data = self.active_data()?;
        activation::activation_fingerprint(
            &data.device_public_key,
            &data.activation_id,
            &data.server_public_key,
        )
    }

    /// `true` when a biometry signature key is provisioned.
    #[must_use]
    pub fn has_biometry_factor(&self) -> bool {
        self.data
            .as_ref()
            .is_some_and(|data| data.signature_keys.has_biometry())
    }

    /// `true` when recovery credentials are stored with the activation.
    #[must_use]
    pub fn has_activation_recovery_data(&self) -> bool {
        self.data
            .as_ref()
            .is_some_and(|data| data.recovery_data_encrypted.is_some())
    }

    /// Protocol version string for HTTP headers; the newest supported when
    /// `version` is `None`.
    #[must_use]
    pub fn max_supported_http_protocol_version(version: Option<ProtocolVersion>) -> &'static str {
        version.unwrap_or(ProtocolVersion::latest()).http_version()
    }

    // -- Serialization ------------------------------------------------------

    /// Serialize session state into an opaque blob.
    ///
    /// During a pending activation this returns the pre-activation state;
    /// ephemeral handshake material is never serialized.
    pub fn serialized_state(&self) -> Result<Vec<u8>> {
        persistence::serialize(self.data.as_ref(), &self.integrity_key())
    }

    /// Restore session state from a previously saved blob. On failure the
    /// session ends up empty.
    pub fn deserialize_state(&mut self, blob: &[u8]) -> Result<()> {
        self.pending = None;
        match persistence::deserialize(blob, &self.integrity_key()) {
            Ok(data) => {
                self.data = data;
                Ok(())
            }
            Err(error) => {
                self.data = None;
                Err(error)
            }
        }
    }

    // -- Activation ---------------------------------------------------------

    /// Start a new activation: validate the optional activation code and its
    /// signature, generate the device keypair.
    pub fn start_activation(&mut self, param: &StartActivationParam) -> Result<StartActivationResult> {
        if !self.can_start_activation() {
            return Err(Error::WrongState);
        }
        if let Some(ref parsed) = param.activation_code {
            if !code::validate_activation_code(&parsed.activation_code) {
                return Err(Error::WrongCode);
            }
            if let Some(ref signature) = parsed.activation_signature {
                let signature_bytes = BASE64
                    .decode(signature.as_bytes())
                    .map_err(|_| Error::WrongData("activation signature is not valid Base64".into()))?;
                crypto::ecdsa_verify(
                    &self.master_server_public_key,
                    parsed.activation_code.as_bytes(),
                    &signature_bytes,
                )?;
            }
        }
        let device_keypair = crypto::EcKeyPair::generate(self.rng.as_mut())?;
        let device_public_key = BASE64.encode(&device_keypair.public_key_bytes(false));
        self.pending = Some(PendingActivation::Step1 { device_keypair });
        Ok(StartActivationResult { device_public_key })
    }

    /// Validate the server's activation response: store the server key,
    /// run ECDH, derive the key family and compute the fingerprint.
    pub fn validate_activation_response(
        &mut self,
        param: &ValidateActivationResponseParam,
    ) -> Result<ValidateActivationResponseResult> {
        let Some(PendingActivation::Step1 { .. }) = self.pending else {
            return Err(Error::WrongState);
        };
        let server_public_key = BASE64
            .decode(param.server_public_key.as_bytes())
            .map_err(|_| Error::WrongData("server public key is not valid Base64".into()))?;
        crypto::validate_public_key(&server_public_key)?;
        let ctr_bytes = BASE64
            .decode(param.ctr_data.as_bytes())
            .map_err(|_| Error::WrongData("ctr_data is not valid Base64".into()))?;
        let ctr_data: [u8; CTR_DATA_LEN] = ctr_bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::WrongData("ctr_data must be 16 bytes".into()))?;
        if let Some(ref recovery) = param.activation_recovery {
            if !code::validate_recovery_code(&recovery.recovery_code, false)
                || !code::validate_recovery_puk(&recovery.puk)
            {
                return Err(Error::WrongCode);
            }
        }

        // The ephemeral keypair moves from step 1 to step 2; on any failure
        // below the pending state is already gone and the caller must reset.
        let Some(PendingActivation::Step1 { device_keypair }) = self.pending.take() else {
            return Err(Error::WrongState);
        };
        let master_secret = device_keypair.ecdh(&server_public_key)?;
        let keys = activation::derive_activation_keys(&master_secret)?;
        let fingerprint = activation::activation_fingerprint(
            &device_keypair.public_key_bytes(false),
            &param.activation_id,
            &server_public_key,
        )?;
        self.pending = Some(PendingActivation::Step2 {
            device_keypair,
            activation_id: param.activation_id.clone(),
            server_public_key,
            ctr_data,
            recovery: param.activation_recovery.clone(),
            keys,
        });
        Ok(ValidateActivationResponseResult {
            activation_fingerprint: fingerprint,
        })
    }

    /// Complete the activation: protect the key family with the caller's
    /// factor keys and commit persistent data.
    ///
    /// The possession unlock key and the user password are mandatory, the
    /// biometry unlock key is optional. Persist [`Session::serialized_state`]
    /// right after this call.
    pub fn complete_activation(&mut self, unlock_keys: &SignatureUnlockKeys) -> Result<()> {
        if !matches!(self.pending, Some(PendingActivation::Step2 { .. })) {
            return Err(Error::WrongState);
        }
        let possession_kek = factors::possession_kek(unlock_keys)?;
        let password = unlock_keys
            .user_password
            .as_ref()
            .ok_or_else(|| Error::WrongParam("missing user password".into()))?;
        let pbkdf2_salt = crypto::random_bytes(self.rng.as_mut(), PBKDF2_SALT_LEN)?;
        let knowledge_kek = factors::knowledge_kek(password, &pbkdf2_salt)?;
        let biometry_kek = match unlock_keys.biometry_unlock_key {
            Some(_) => Some(factors::biometry_kek(unlock_keys)?),
            None => None,
        };
        let eek = self.eek.clone();

        let Some(PendingActivation::Step2 {
            device_keypair,
            activation_id,
            server_public_key,
            ctr_data,
            recovery,
            keys,
        }) = self.pending.take()
        else {
            return Err(Error::WrongState);
        };
        let result = Self::build_persistent_data(
            &device_keypair,
            &activation_id,
            &server_public_key,
            ctr_data,
            recovery.as_ref(),
            &keys,
            &possession_kek,
            &knowledge_kek,
            biometry_kek.as_ref(),
            eek.as_ref(),
            pbkdf2_salt,
        )?;
        self.data = Some(result);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn build_persistent_data(
        device_keypair: &crypto::EcKeyPair,
        activation_id: &str,
        server_public_key: &[u8],
        ctr_data: [u8; CTR_DATA_LEN],
        recovery: Option<&RecoveryData>,
        keys: &ActivationKeys,
        possession_kek: &SecretKey,
        knowledge_kek: &SecretKey,
        biometry_kek: Option<&SecretKey>,
        eek: Option<&SecretKey>,
        pbkdf2_salt: Vec<u8>,
    ) -> Result<PersistentData> {
        let biometry = match biometry_kek {
            Some(biometry_kek) => {
                let biometry_key = activation::derive_biometry_key(&keys.vault)?;
                Some(factors::wrap_key(&biometry_key, biometry_kek, eek)?)
            }
            None => None,
        };
        let signature_keys = SignatureKeysBlob {
            possession: factors::wrap_key(&keys.possession, possession_kek, eek)?,
            knowledge: factors::wrap_key(&keys.knowledge, knowledge_kek, eek)?,
            biometry,
            transport: factors::wrap_key(&keys.transport, possession_kek, eek)?,
            signature_key_encryption: factors::wrap_key(
                &keys.signature_key_encryption,
                possession_kek,
                eek,
            )?,
        };
        let device_private_key_encrypted = vault::seal_device_private_key(
            &keys.vault,
            activation_id,
            &device_keypair.private_key_bytes(),
        )?;
        let recovery_data_encrypted = match recovery {
            Some(recovery) => Some(vault::seal_recovery_data(&keys.vault, activation_id, recovery)?),
            None => None,
        };
        Ok(PersistentData {
            activation_id: activation_id.to_owned(),
            server_public_key: crypto::compress_public_key(server_public_key)?,
            device_public_key: device_keypair.public_key_bytes(false),
            device_private_key_encrypted,
            signature_keys,
            counter: SignatureCounter::Hash(ctr_data),
            counter_byte: 0,
            pbkdf2_salt,
            protocol_version: ProtocolVersion::V3,
            pending_upgrade_version: None,
            recovery_data_encrypted,
            eek_used: eek.is_some(),
            failed_attempts: 0,
            max_failed_attempts: 0,
        })
    }

    // -- Signing ------------------------------------------------------------

    /// Normalize GET parameters into a signable body.
    pub fn prepare_key_value_dictionary_for_data_signing(
        pairs: &[(String, String)],
    ) -> Result<Vec<u8>> {
        signature::normalize_key_value_map(pairs)
    }

    /// Compute a multi-factor signature over an HTTP request.
    ///
    /// On success the signature counter has advanced in memory; persist
    /// [`Session::serialized_state`] or the client will drift away from the
    /// server. A failed call leaves the counter untouched.
    pub fn sign_http_request_data(
        &mut self,
        request: &HttpRequestData,
        unlock_keys: &SignatureUnlockKeys,
        factor: SignatureFactor,
    ) -> Result<HttpRequestDataSignature> {
        if request.method.is_empty() {
            return Err(Error::WrongParam("empty HTTP method".into()));
        }
        let factor_string = factor.factor_string()?;
        let nonce: [u8; NONCE_LEN] = match request.offline_nonce {
            Some(ref nonce) => BASE64
                .decode(nonce.as_bytes())
                .ok()
                .and_then(|bytes| bytes.as_slice().try_into().ok())
                .ok_or_else(|| Error::WrongParam("offline nonce must be 16 Base64 bytes".into()))?,
            None => crypto::random_array(self.rng.as_mut())?,
        };

        let data = self.data.as_ref().ok_or(Error::WrongState)?;
        let eek = Self::eek_for(&self.eek, data)?;
        let possession_kek = factors::possession_kek(unlock_keys)?;

        let mut factor_keys = Vec::with_capacity(3);
        factor_keys.push(factors::unwrap_key(
            &data.signature_keys.possession,
            &possession_kek,
            eek,
        )?);
        if factor.contains(SignatureFactor::KNOWLEDGE) {
            let password = unlock_keys
                .user_password
                .as_ref()
                .ok_or_else(|| Error::WrongParam("missing user password".into()))?;
            let knowledge_kek = factors::knowledge_kek(password, &data.pbkdf2_salt)?;
            factor_keys.push(factors::unwrap_key(
                &data.signature_keys.knowledge,
                &knowledge_kek,
                eek,
            )?);
        }
        if factor.contains(SignatureFactor::BIOMETRY) {
            let slot = data
                .signature_keys
                .biometry
                .as_ref()
                .ok_or(Error::WrongState)?;
            let biometry_kek = factors::biometry_kek(unlock_keys)?;
            factor_keys.push(factors::unwrap_key(slot, &biometry_kek, eek)?);
        }

        let normalized = signature::normalize_signed_data(
            &request.method,
            &request.uri_identifier,
            &nonce,
            &request.body,
            &self.setup.application_secret,
        );
        let ctr_bytes = data.counter.signature_bytes();
        let computed = signature::compute_signature(&factor_keys, &ctr_bytes, &normalized)?;

        // Advance the counter only after the signature exists; any failure
        // above leaves persistent data untouched.
        let data = self.data.as_mut().ok_or(Error::WrongState)?;
        data.counter = data.counter.next();
        data.counter_byte = data.counter_byte.wrapping_add(1);

        Ok(HttpRequestDataSignature {
            activation_id: data.activation_id.clone(),
            application_key: self.setup.application_key.clone(),
            nonce: signature::encode_nonce(&nonce),
            factor: factor_string.to_owned(),
            signature: computed,
            version: data.protocol_version.http_version().to_owned(),
        })
    }

    /// Verify data signed by the server.
    pub fn verify_server_signed_data(
        &self,
        data: &[u8],
        signature_der: &[u8],
        key: SigningKey,
    ) -> Result<()> {
        if signature_der.is_empty() {
            return Err(Error::WrongSignature);
        }
        let public_key = match key {
            SigningKey::MasterServer => self.master_server_public_key.as_slice(),
            SigningKey::PersonalizedServer => {
                self.active_data()?.server_public_key.as_slice()
            }
        };
        crypto::ecdsa_verify(public_key, data, signature_der)
    }

    // -- Status -------------------------------------------------------------

    /// Random Base64 challenge for a status request.
    pub fn generate_activation_status_challenge(&mut self) -> Result<String> {
        let challenge: [u8; NONCE_LEN] = crypto::random_array(self.rng.as_mut())?;
        Ok(BASE64.encode(&challenge))
    }

    /// Decode an encrypted activation status blob.
    ///
    /// When the decoded status reports `needs_serialize_session_state` the
    /// local counter was resynchronized from the server and the state must
    /// be persisted.
    pub fn decode_activation_status(
        &mut self,
        encrypted: &EncryptedActivationStatus,
        unlock_keys: &SignatureUnlockKeys,
    ) -> Result<ActivationStatus> {
        let data = self.data.as_ref().ok_or(Error::WrongState)?;
        let transport = self.unwrap_transport(data, unlock_keys)?;
        let decoded = status::decode_status(
            encrypted,
            &transport,
            data.protocol_version,
            data.counter_byte,
        )?;

        let data = self.data.as_mut().ok_or(Error::WrongState)?;
        if let Some((ctr_data, counter_byte)) = decoded.resync_counter {
            if data.protocol_version == ProtocolVersion::V3 {
                data.counter = SignatureCounter::Hash(ctr_data);
                data.counter_byte = counter_byte;
            }
        }
        data.failed_attempts = decoded.status.fail_count;
        data.max_failed_attempts = decoded.status.max_fail_count;
        Ok(decoded.status)
    }

    // -- Signature keys management ------------------------------------------

    /// Re-wrap the knowledge factor under a new password.
    ///
    /// The old password is not validated here; validate it against the
    /// server first, then persist the state after this call.
    pub fn change_user_password(&mut self, old: &Password, new: &Password) -> Result<()> {
        let data = self.data.as_ref().ok_or(Error::WrongState)?;
        let eek = Self::eek_for(&self.eek, data)?;
        let old_kek = factors::knowledge_kek(old, &data.pbkdf2_salt)?;
        let knowledge_key = factors::unwrap_key(&data.signature_keys.knowledge, &old_kek, eek)?;

        let new_salt = crypto::random_bytes(self.rng.as_mut(), PBKDF2_SALT_LEN)?;
        let new_kek = factors::knowledge_kek(new, &new_salt)?;
        let eek = self.eek.clone();
        let data = self.data.as_mut().ok_or(Error::WrongState)?;
        data.signature_keys.knowledge =
            factors::wrap_key(&knowledge_key, &new_kek, eek.as_ref())?;
        data.pbkdf2_salt = new_salt;
        Ok(())
    }

    /// Provision the biometry factor from a server-issued vault key.
    ///
    /// Unlocking the vault key takes the possession unlock key and the user
    /// password, in addition to the new biometry unlock key.
    pub fn add_biometry_factor(
        &mut self,
        encrypted_vault_key: &str,
        unlock_keys: &SignatureUnlockKeys,
    ) -> Result<()> {
        let biometry_kek = factors::biometry_kek(unlock_keys)?;
        let vault_key = self.unwrap_vault_key(encrypted_vault_key, unlock_keys)?;
        let biometry_key = activation::derive_biometry_key(&vault_key)?;
        let eek = self.eek.clone();
        let data = self.data.as_mut().ok_or(Error::WrongState)?;
        data.signature_keys.biometry =
            Some(factors::wrap_key(&biometry_key, &biometry_kek, eek.as_ref())?);
        Ok(())
    }

    /// Remove the biometry factor key.
    pub fn remove_biometry_factor(&mut self) -> Result<()> {
        let data = self.data.as_mut().ok_or(Error::WrongState)?;
        if data.signature_keys.biometry.take().is_none() {
            return Err(Error::WrongState);
        }
        Ok(())
    }

    // -- Vault operations ----------------------------------------------------

    /// Derive an application key from the vault key and a caller index.
    /// Requires the possession unlock key and the user password.
    pub fn derive_cryptographic_key_from_vault_key(
        &mut self,
        encrypted_vault_key: &str,
        unlock_keys: &SignatureUnlockKeys,
        key_index: u64,
    ) -> Result<SecretKey> {
        let vault_key = self.unwrap_vault_key(encrypted_vault_key, unlock_keys)?;
        vault::derive_cryptographic_key(&vault_key, key_index)
    }

    /// ECDSA-sign `data` with the device private key unlocked by the vault
    /// key. Requires the possession unlock key and the user password; the
    /// plaintext private key is wiped before returning.
    pub fn sign_data_with_device_private_key(
        &mut self,
        encrypted_vault_key: &str,
        unlock_keys: &SignatureUnlockKeys,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Err(Error::WrongParam("no data to sign".into()));
        }
        let vault_key = self.unwrap_vault_key(encrypted_vault_key, unlock_keys)?;
        let session_data = self.active_data()?;
        let private_key = vault::open_device_private_key(
            &vault_key,
            &session_data.activation_id,
            &session_data.device_private_key_encrypted,
        )?;
        let keypair = crypto::EcKeyPair::from_private_bytes(private_key.expose())?;
        keypair.sign(data)
    }

    /// Decrypt the recovery credentials stored with the activation.
    /// Requires the possession unlock key and the user password.
    pub fn activation_recovery_data(
        &mut self,
        encrypted_vault_key: &str,
        unlock_keys: &SignatureUnlockKeys,
    ) -> Result<RecoveryData> {
        let vault_key = self.unwrap_vault_key(encrypted_vault_key, unlock_keys)?;
        let data = self.active_data()?;
        let sealed = data
            .recovery_data_encrypted
            .as_ref()
            .ok_or(Error::WrongState)?;
        vault::open_recovery_data(&vault_key, &data.activation_id, sealed)
    }

    // -- External encryption key ---------------------------------------------

    /// `true` when an EEK is available at runtime.
    #[must_use]
    pub fn has_external_encryption_key(&self) -> bool {
        self.eek.is_some()
    }

    /// Provide a known EEK to a session restored without one.
    pub fn set_external_encryption_key(&mut self, key: SecretKey) -> Result<()> {
        if key.is_zero() {
            return Err(Error::WrongParam("zero-filled external encryption key".into()));
        }
        if self.eek.is_some() {
            return Err(Error::WrongState);
        }
        if let Some(ref data) = self.data {
            if !data.eek_used {
                return Err(Error::WrongState);
            }
        }
        self.eek = Some(key);
        Ok(())
    }

    /// Add an EEK layer to an activated session that does not use one yet.
    pub fn add_external_encryption_key(&mut self, key: SecretKey) -> Result<()> {
        if key.is_zero() {
            return Err(Error::WrongParam("zero-filled external encryption key".into()));
        }
        let data = self.data.as_mut().ok_or(Error::WrongState)?;
        if data.eek_used || self.eek.is_some() {
            return Err(Error::WrongState);
        }
        apply_eek_layer(&mut data.signature_keys, &key, true)?;
        data.eek_used = true;
        self.eek = Some(key);
        Ok(())
    }

    /// Permanently remove the EEK layer from an activated session.
    pub fn remove_external_encryption_key(&mut self) -> Result<()> {
        let eek = self.eek.clone().ok_or(Error::WrongState)?;
        let data = self.data.as_mut().ok_or(Error::WrongState)?;
        if !data.eek_used {
            return Err(Error::WrongState);
        }
        apply_eek_layer(&mut data.signature_keys, &eek, false)?;
        data.eek_used = false;
        self.eek = None;
        Ok(())
    }

    // -- ECIES ---------------------------------------------------------------

    /// Build an ECIES encryptor for the requested scope.
    ///
    /// Activation scope needs the possession unlock key to mix the transport
    /// key into `sharedInfo2`; application scope works on any session.
    pub fn ecies_encryptor_for_scope(
        &self,
        scope: EciesEncryptorScope,
        unlock_keys: Option<&SignatureUnlockKeys>,
        shared_info1: &[u8],
    ) -> Result<EciesEncryptor> {
        match scope {
            EciesEncryptorScope::Application => {
                let shared_info2 = crypto::sha256(self.setup.application_secret.as_bytes());
                EciesEncryptor::new(&self.master_server_public_key, shared_info1, &shared_info2)
            }
            EciesEncryptorScope::Activation => {
                let data = self.active_data()?;
                let unlock_keys = unlock_keys
                    .ok_or_else(|| Error::WrongParam("missing unlock keys".into()))?;
                let transport = self.unwrap_transport(data, unlock_keys)?;
                let shared_info2 = crypto::hmac_sha256(
                    transport.expose(),
                    self.setup.application_secret.as_bytes(),
                );
                EciesEncryptor::new(&data.server_public_key, shared_info1, &shared_info2)
            }
        }
    }

    // -- Protocol upgrade ----------------------------------------------------

    /// Formally start the upgrade to the newest protocol version.
    /// Idempotent while the upgrade is pending.
    pub fn start_protocol_upgrade(&mut self) -> Result<()> {
        let data = self.data.as_mut().ok_or(Error::WrongState)?;
        match data.pending_upgrade_version {
            Some(_) => Ok(()),
            None if data.protocol_version < ProtocolVersion::latest() => {
                data.pending_upgrade_version = Some(ProtocolVersion::latest());
                Ok(())
            }
            None => Err(Error::WrongState),
        }
    }

    /// Version the session is being upgraded to, if any.
    #[must_use]
    pub fn pending_protocol_upgrade_version(&self) -> Option<ProtocolVersion> {
        self.data.as_ref().and_then(|data| data.pending_upgrade_version)
    }

    /// Install the V3 counter seed received from the server and switch the
    /// activation to V3.
    pub fn apply_protocol_upgrade_data(&mut self, ctr_data: &[u8; CTR_DATA_LEN]) -> Result<()> {
        let data = self.data.as_mut().ok_or(Error::WrongState)?;
        if data.pending_upgrade_version != Some(ProtocolVersion::V3)
            || data.protocol_version != ProtocolVersion::V2
        {
            return Err(Error::WrongState);
        }
        data.counter = SignatureCounter::Hash(*ctr_data);
        data.counter_byte = 0;
        data.protocol_version = ProtocolVersion::V3;
        Ok(())
    }

    /// Finish the upgrade once the stored version matches the pending
    /// target.
    pub fn finish_protocol_upgrade(&mut self) -> Result<()> {
        let data = self.data.as_mut().ok_or(Error::WrongState)?;
        match data.pending_upgrade_version {
            Some(target) if data.protocol_version == target => {
                data.pending_upgrade_version = None;
                Ok(())
            }
            _ => Err(Error::WrongState),
        }
    }

    // -- Key utilities -------------------------------------------------------

    /// Reduce arbitrary device-bound data into a possession unlock key.
    #[must_use]
    pub fn normalize_signature_unlock_key_from_data(data: &[u8]) -> SecretKey {
        SecretKey::new(crypto::xor_fold(&crypto::sha256(data)))
    }

    /// Generate a fresh random unlock key.
    pub fn generate_signature_unlock_key(&mut self) -> Result<SecretKey> {
        // A zero key would be indistinguishable from an uninitialized
        // buffer, so it is rejected by the factor layer; retry.
        for _ in 0..4 {
            let key = SecretKey::new(crypto::random_array(self.rng.as_mut())?);
            if !key.is_zero() {
                return Ok(key);
            }
        }
        Err(Error::Encryption)
    }

    // -- Internals -----------------------------------------------------------

    fn integrity_key(&self) -> [u8; 32] {
        persistence::integrity_key(self.application_secret_bytes.expose())
    }

    fn active_data(&self) -> Result<&PersistentData> {
        self.data.as_ref().ok_or(Error::WrongState)
    }

    /// EEK required for factor unwrap when the activation uses one.
    fn eek_for<'a>(eek: &'a Option<SecretKey>, data: &PersistentData) -> Result<Option<&'a SecretKey>> {
        if data.eek_used {
            eek.as_ref().map(Some).ok_or(Error::WrongState)
        } else {
            Ok(None)
        }
    }

    fn unwrap_transport(
        &self,
        data: &PersistentData,
        unlock_keys: &SignatureUnlockKeys,
    ) -> Result<SecretKey> {
        let eek = Self::eek_for(&self.eek, data)?;
        let possession_kek = factors::possession_kek(unlock_keys)?;
        factors::unwrap_key(&data.signature_keys.transport, &possession_kek, eek)
    }

    fn unwrap_knowledge(
        &self,
        data: &PersistentData,
        unlock_keys: &SignatureUnlockKeys,
    ) -> Result<SecretKey> {
        let eek = Self::eek_for(&self.eek, data)?;
        let password = unlock_keys
            .user_password
            .as_ref()
            .ok_or_else(|| Error::WrongParam("missing user password".into()))?;
        let knowledge_kek = factors::knowledge_kek(password, &data.pbkdf2_salt)?;
        factors::unwrap_key(&data.signature_keys.knowledge, &knowledge_kek, eek)
    }

    /// The vault key is double-wrapped under the transport key and the
    /// knowledge signature key; recovering it takes the possession unlock
    /// key and the user password.
    fn unwrap_vault_key(
        &self,
        encrypted_vault_key: &str,
        unlock_keys: &SignatureUnlockKeys,
    ) -> Result<SecretKey> {
        let data = self.active_data()?;
        if unlock_keys.user_password.is_none() {
            return Err(Error::WrongParam("missing user password".into()));
        }
        let transport = self.unwrap_transport(data, unlock_keys)?;
        let knowledge = self.unwrap_knowledge(data, unlock_keys)?;
        vault::unwrap_vault_key(encrypted_vault_key, &transport, &knowledge)
    }
}

/// Add or remove the EEK layer on every wrapped slot.
fn apply_eek_layer(keys: &mut SignatureKeysBlob, eek: &SecretKey, add: bool) -> Result<()> {
    let transform = |slot: &[u8]| -> Result<Vec<u8>> {
        if add {
            crypto::aes_cbc_encrypt(eek.expose(), &crypto::ZERO_IV, slot)
        } else {
            crypto::aes_cbc_decrypt(eek.expose(), &crypto::ZERO_IV, slot)
        }
    };
    let possession = transform(&keys.possession)?;
    let knowledge = transform(&keys.knowledge)?;
    let biometry = match keys.biometry {
        Some(ref slot) => Some(transform(slot)?),
        None => None,
    };
    let transport = transform(&keys.transport)?;
    let signature_key_encryption = transform(&keys.signature_key_encryption)?;
    keys.possession = possession;
    keys.knowledge = knowledge;
    keys.biometry = biometry;
    keys.transport = transport;
    keys.signature_key_encryption = signature_key_encryption;
    Ok(())
}
