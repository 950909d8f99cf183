//! # Synapse Piece
//!
//! Content-addressed piece identifiers for the Synapse storage SDK.
//!
//! This crate provides:
//! - **PieceCid**: opaque content address with parse/stringify
//! - **Size bounds**: the accepted upload window for a single piece
//! - **Verification**: re-hash downloaded bytes against a requested piece
//!
//! ## Example
//!
//! ```rust
//! use synapse_piece::{calculate, validate_upload_size, PieceCid};
//!
//! let data = vec![7u8; 256];
//! validate_upload_size(data.len() as u64).unwrap();
//!
//! let piece = calculate(&data);
//! let parsed: PieceCid = piece.to_string().parse().unwrap();
//! assert_eq!(piece, parsed);
//! ```

pub mod error;
pub mod piece;

pub use error::{PieceError, Result};
pub use piece::{calculate, verify, PieceCid, PieceVerifier, PIECE_CODEC};

/// Smallest payload a storage provider accepts (bytes)
pub const MIN_UPLOAD_SIZE: u64 = 127;

/// Largest payload a single piece may hold: 1 GiB of padded space, 127/128 usable
pub const MAX_UPLOAD_SIZE: u64 = 1024 * 1024 * 1024 / 128 * 127;

/// Check that a payload length fits in a single piece
pub fn validate_upload_size(size: u64) -> Result<()> {
    if !(MIN_UPLOAD_SIZE..=MAX_UPLOAD_SIZE).contains(&size) {
        return Err(PieceError::SizeOutOfBounds {
            size,
            min: MIN_UPLOAD_SIZE,
            max: MAX_UPLOAD_SIZE,
        });
    }
    Ok(())
}
