// Cryptography module: data key lifecycle and field-bundle encryption

pub mod codec;
pub mod keys;

pub use codec::{record_aad, CodecError, EncryptedBlob, RecordCodec, Stored};
pub use keys::{DataKey, KeyManager};
