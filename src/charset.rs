//! Charset name to collation id mapping (C1).
//!
//! Only the handful of charsets commonly negotiated by clients are listed;
//! an unknown name falls back to `utf8mb4_general_ci` rather than failing,
//! mirroring the permissive behavior of the reference driver's charset
//! table (unknown names are accepted and resolved server-side anyway).

/// Collation id for MySQL's `binary` charset. Columns tagged with this id
/// are treated as opaque bytes rather than UTF-8 text during row decoding.
pub const COLLATION_BINARY: u16 = 63;

/// Default collation sent in the handshake response when the caller does
/// not request a specific charset.
pub const DEFAULT_COLLATION: u16 = 45; // utf8mb4_general_ci

/// Resolve a charset name (as accepted by `Opts::charset`) to its collation id.
pub fn collation_for_name(name: &str) -> u16 {
    match name.to_ascii_lowercase().as_str() {
        "utf8mb4" => 45,         // utf8mb4_general_ci
        "utf8mb4_unicode_ci" => 224,
        "utf8" | "utf8mb3" => 33, // utf8_general_ci
        "latin1" => 8,           // latin1_swedish_ci
        "ascii" => 11,           // ascii_general_ci
        "binary" => COLLATION_BINARY,
        _ => DEFAULT_COLLATION,
    }
}
