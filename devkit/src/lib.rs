/*!
# Tether DevKit - Stubs et utilitaires de test

Bibliothèque facilitant les tests du kernel Tether avec:
- Stub du collaborateur push (sans broker MQTT)
- Builders d'uploads device (JSON, imbriqué, zlib)
- Harness assemblant un moteur complet sur store mémoire et horloge manuelle
*/

pub mod push_stub;
pub mod test_utils;
pub mod upload_builder;

pub use push_stub::{PushedMessage, RecordingPush};
pub use test_utils::TestHarness;
pub use upload_builder::UploadBuilder;
