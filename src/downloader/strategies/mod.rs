pub mod aria2;
pub mod fallback;
pub mod iwara_downloader;
pub mod native;

// Re-export backends for easy access
pub use aria2::{Aria2Backend, Aria2Client};
pub use fallback::{FallbackBackend, SystemOpener, UrlOpener};
pub use iwara_downloader::IwaraDownloaderBackend;
pub use native::NativeBackend;
