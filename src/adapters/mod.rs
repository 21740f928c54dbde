/// Adapter layer for interface implementations.
///
/// This module contains adapters that implement the storage contracts:
/// - Persistence adapters (metadata backends and their cursors)
pub mod persistence;
