//! Client side of the `org.emosense.Models1` interface served by emosensed.

use zbus::proxy;

pub const SERVICE: &str = "org.emosense.Models1";

#[proxy(
    interface = "org.emosense.Models1",
    default_service = "org.emosense.Models1",
    default_path = "/org/emosense/Models1"
)]
pub trait Models {
    async fn status(&self) -> zbus::Result<String>;
    async fn check_for_updates(&self, force: bool) -> zbus::Result<bool>;
    async fn download_model(&self, version: u32, url: &str) -> zbus::Result<()>;
    async fn cancel_download(&self, version: u32) -> zbus::Result<bool>;
    async fn download_progress(&self, version: u32) -> zbus::Result<f64>;
    async fn download_state(&self, version: u32) -> zbus::Result<String>;
    async fn model_version(&self) -> zbus::Result<u32>;
    async fn model_path(&self) -> zbus::Result<String>;
}
