#![deny(unsafe_code)]

//! Multi-field framing carried on pipes request and response bodies.
//!
//! A body is a sequence of frames `OK:<type>:<len>:<body>`, where `type` matches
//! `[0-9A-Za-z]+` and `len` is the body length in bytes. Frames may arrive cut at any byte
//! boundary; both [`Multi`] and [`MultiCodec`] reassemble them before handing them out.
//!
//! ```
//! use pipes_codec::Multi;
//!
//! let out = Multi::new(4);
//! let chunks = out.send("id", "pipes-1:7").unwrap();
//! assert!(chunks.iter().all(|c| c.len() <= 4));
//!
//! let mut inp = Multi::default();
//! let frames = chunks.iter().flat_map(|c| inp.feed(c).unwrap()).collect::<Vec<_>>();
//! assert_eq!(frames[0].typ(), "id");
//! assert_eq!(frames[0].body_str().unwrap(), "pipes-1:7");
//! assert!(inp.end().is_ok());
//! ```

mod codec;
/// Error types for framing operations
pub mod error;
mod frame;
mod multi;

pub use codec::MultiCodec;
pub use error::FramingError;
pub use frame::Frame;
pub use multi::{Multi, DEFAULT_MAX_CHUNK_SIZE};
