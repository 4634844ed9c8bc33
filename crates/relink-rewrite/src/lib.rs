//! Reference rewriting for stored field values.
//!
//! [`ReferenceResolver`] decides, for a single embedded reference, whether a
//! migrated counterpart exists on disk. [`ValueRewriter`] walks a stored value
//! (serialized composite, JSON document or plain markup) and applies the
//! resolver to every reference it finds without disturbing the encoding.

mod protected;
mod resolver;
mod scan;
pub mod serialized;
#[cfg(test)]
mod test_support;
mod value;

pub use protected::{AssetIndex, ProtectedFieldPolicy, ProtectedOutcome};
pub use resolver::{AssetFs, LocalFs, ReferenceResolver, Resolution, ResolverConfig, TargetNaming};
pub use scan::ReferenceScanner;
pub use serialized::{CodecError, SerializedKey, SerializedValue};
pub use value::{FieldValue, RewriteConfig, RewriteOutcome, ValueRewriter};
