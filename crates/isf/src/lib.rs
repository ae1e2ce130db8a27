//! Shader source builder for ISF-style layer shaders.
//!
//! A layer shader is GLSL ES-flavoured fragment code preceded by a JSON
//! metadata comment that declares its inputs and, optionally, a list of
//! render passes. [`build`] turns that text into a GLSL 450 fragment shader
//! the GPU backend can compile:
//!
//! ```text
//!   raw source ──▶ metadata::extract ──▶ Metadata { INPUTS, PASSES }
//!        │                                     │
//!        ▼                                     ▼
//!   body (comment blanked) ──▶ header (uniform block, samplers, macros)
//!        │                                     │
//!        └──────────▶ BuiltShader { source, inputs, passes, header_line_count }
//! ```
//!
//! The crate is GPU-free; values for declared inputs live in [`values`] and
//! pass sizes are resolved by [`expr`].

pub mod expr;
pub mod metadata;
pub mod source;
pub mod values;

pub use metadata::{InputDecl, InputKind, Metadata, MetadataError, PassDescriptor};
pub use source::{build, BuiltShader, VERTEX_SHADER};
pub use values::{bool_member_name, InputValue, TextValue, UniformData};
