pub mod codec;

use thiserror::Error;
use serde::{Deserialize, Serialize};

/// 완성 셸 소켓에서 한 번에 읽는 청크 크기
pub const BUFFER_SIZE: usize = 1024;

/// 모든 응답을 끝내는 종료 마커 — 이 마커가 없으면 응답은 불완전한 것
pub const END_MARKER: &str = "END@@";

/// 진행 상황 마커 (상세 정보 없음)
pub const PROCESSING_MARKER: &str = "@@PROCESSING_END@@";

/// 진행 상황 마커 접두사 — `@@PROCESSING:<encoded-text>END@@` 형태
pub const PROCESSING_DETAIL_PREFIX: &str = "@@PROCESSING:";

/// 응답 페이로드 앞에 붙는 응답 타입 토큰 (파싱 전에 제거)
pub const COMPLETIONS_PREFIX: &str = "@@COMPLETIONS";

/// 타입 정보가 없는 레코드의 기본 타입 태그
pub const TYPE_UNKNOWN: &str = "-1";

/// 서버가 에러를 데이터로 흘려보낼 때 쓰는 센티널 토큰
pub const ERROR_SENTINEL: &str = "ERROR:";

/// 프로토콜 통신 오류 타입
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// 유휴 한도까지 기다렸지만 종료 마커가 오지 않음.
    /// 지금까지 누적된 페이로드를 진단용으로 보존한다.
    #[error("response missing terminal marker")]
    MissingTerminator { payload: String },

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// 디코딩된 완성 항목 하나
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub token: String,
    pub description: String,
    /// 인자 목록 문자열 (없으면 빈 문자열)
    #[serde(default)]
    pub args: String,
    /// 타입 태그 (없으면 [`TYPE_UNKNOWN`])
    #[serde(default)]
    pub typ: String,
}

/// 완성 요청 한 번의 전체 결과
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completions {
    /// 모듈/파일 이름 — 서버가 알려주지 않을 수도 있음
    pub file: Option<String>,
    pub records: Vec<CompletionRecord>,
}

impl Completions {
    /// 실패 경로에서 호출자에게 돌려주는 빈 결과
    pub fn invalid() -> Self {
        Self {
            file: None,
            records: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// 정의 검색(`@@SEARCH`) 결과 — 첫 레코드에서 위치 정보를 해석한 것
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub file: Option<String>,
    /// 토큰이 실제로 발견된 이름
    pub found_as: String,
    pub line: u32,
    pub col: u32,
}

/// "작업 중" 알림을 받는 진행 상황 싱크.
/// 구현은 블로킹하면 안 됨 — 읽기 루프 안에서 호출된다.
pub trait ProgressSink: Send + Sync {
    fn worked(&self, description: &str);
}
