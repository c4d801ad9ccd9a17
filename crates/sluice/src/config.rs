use sluice_net::MuxConfig;
use sluice_transfer::TransferConfig;

/// Port of the control (request/response) service.
pub const DEFAULT_CONTROL_PORT: u16 = 6668;

#[derive(Debug, Clone, Copy)]
pub struct AppConfig {
    pub control_port: u16,
    pub transfer: TransferConfig,
    pub mux: MuxConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let control_port = std::env::var("SLUICE_CONTROL_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .filter(|p| *p != 0)
            .unwrap_or(DEFAULT_CONTROL_PORT);

        Self {
            control_port,
            transfer: TransferConfig::from_env(),
            mux: MuxConfig::from_env(),
        }
    }
}
