//! Remote storage for tether: the `BlobStore` trait, an HTTP
//! implementation, an in-memory test double, and the payload encryption
//! boundary.

pub mod crypto;
pub mod http;
pub mod memory;
pub mod store;

pub use crypto::{ChaChaEncryptor, Encryptor, PlainEncryptor};
pub use http::{CloudConfig, HttpBlobStore};
pub use memory::MemoryBlobStore;
pub use store::{BlobStore, CloudMetadata, DeltaRef};
