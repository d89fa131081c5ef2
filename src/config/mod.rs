use serde::Deserialize;
use std::time::Duration;

/// 셸 공급/핸드셰이크/프로토콜 타이밍 설정.
///
/// `config/shell.toml`에서 읽으며(경로는 `PYSHELL_CONFIG` 환경 변수로
/// 재정의 가능), 파일이 없거나 깨져 있으면 기본값으로 동작한다.
#[derive(Deserialize, Debug, Clone)]
pub struct ShellConfig {
    /// 연결 핸드셰이크 최대 시도 횟수
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// 시도 하나에 허용되는 벽시계 시간 (ms)
    #[serde(default = "default_attempt_window_ms")]
    pub attempt_window_ms: u64,
    /// accept 폴링 사이의 대기 (ms)
    #[serde(default = "default_accept_poll_ms")]
    pub accept_poll_ms: u64,
    /// 실패한 시도 사이의 대기 (ms)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// 프로세스 기동 후 워밍업 대기 (ms)
    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,
    /// 연결된 소켓의 읽기 타임아웃 (ms)
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// 읽기 루프에서 데이터 없는 반복의 상한
    #[serde(default = "default_idle_ceiling")]
    pub idle_ceiling: u32,
    /// 읽기 루프 반복 사이의 대기 (ms)
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// 게이트 획득 폴링 간격 (ms)
    #[serde(default = "default_gate_poll_ms")]
    pub gate_poll_ms: u64,
}

fn default_connect_attempts() -> u32 {
    5
}
fn default_attempt_window_ms() -> u64 {
    5000
}
fn default_accept_poll_ms() -> u64 {
    500
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_warmup_ms() -> u64 {
    200
}
fn default_read_timeout_ms() -> u64 {
    5000
}
fn default_idle_ceiling() -> u32 {
    200
}
fn default_idle_poll_ms() -> u64 {
    10
}
fn default_gate_poll_ms() -> u64 {
    25
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            connect_attempts: default_connect_attempts(),
            attempt_window_ms: default_attempt_window_ms(),
            accept_poll_ms: default_accept_poll_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            warmup_ms: default_warmup_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            idle_ceiling: default_idle_ceiling(),
            idle_poll_ms: default_idle_poll_ms(),
            gate_poll_ms: default_gate_poll_ms(),
        }
    }
}

impl ShellConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("PYSHELL_CONFIG")
            .unwrap_or_else(|_| "config/shell.toml".to_string());
        Self::load_from(&path)
    }

    /// 지정한 경로에서 로드. 파일이 없거나 깨져 있으면 기본값으로 동작.
    pub fn load_from(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path.as_ref()).unwrap_or_default();
        let cfg: Self = toml::from_str(&s).unwrap_or_default();
        Ok(cfg)
    }

    pub fn attempt_window(&self) -> Duration {
        Duration::from_millis(self.attempt_window_ms)
    }

    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn gate_poll(&self) -> Duration {
        Duration::from_millis(self.gate_poll_ms)
    }
}
