//! 셸 전용 에러 타입 — 기동 실패인지, 연결 실패인지, 호출 시점의 상태
//! 오류인지를 구분해서 호출자가 재시도 여부를 판단할 수 있게 합니다.

use crate::protocol::ProtocolError;

#[derive(thiserror::Error, Debug)]
pub enum ShellError {
    /// 전체 셧다운 이후의 모든 작업 — 치명적, 재시도 불가
    #[error("shells are finished for good; no shell may be created or restarted")]
    Terminated,

    /// 서브프로세스가 뜨지 않았거나 연결 전에 죽음
    #[error("failed to launch completion server: {0}")]
    Launch(String),

    /// 핸드셰이크 시도 소진 — 기동 로그를 진단용으로 포함
    #[error("could not connect to completion server ({reason})\n{launch_log}")]
    Connect { reason: String, launch_log: String },

    /// 기동 중/미연결/읽기·쓰기 겹침 상태에서의 호출
    #[error("invalid shell state: {0}")]
    InvalidState(String),

    #[error("shell state lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ShellError::Terminated;
        assert!(err.to_string().contains("finished for good"));

        let err = ShellError::Connect {
            reason: "no accept after 3 attempts".to_string(),
            launch_log: "python server.py 38765".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("no accept after 3 attempts"));
        assert!(msg.contains("python server.py 38765"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: ShellError = io.into();
        assert!(matches!(err, ShellError::Io(_)));
    }
}
