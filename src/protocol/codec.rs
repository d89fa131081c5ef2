//! 요청 인코딩과 프레이밍된 응답 읽기/파싱.
//!
//! 와이어 포맷은 개행/마커로 구분되는 평문 텍스트다. 임의의 페이로드는
//! 퍼센트 인코딩으로 감싸고, 응답은 `END@@` 종료 마커가 나올 때까지
//! 고정 크기 청크로 읽는다. 읽는 중간에 서버가 보내는
//! `@@PROCESSING...` 마커는 진행 상황으로 보고한 뒤 버퍼에서 제거한다.

use std::io::Read;
use std::time::Duration;

use super::{
    CompletionRecord, Completions, ProgressSink, ProtocolError, BUFFER_SIZE, COMPLETIONS_PREFIX,
    END_MARKER, ERROR_SENTINEL, PROCESSING_DETAIL_PREFIX, PROCESSING_MARKER, TYPE_UNKNOWN,
};

/// import 완성 요청: `@@IMPORTS:<enc>\nEND@@`
pub fn encode_import_completions(prefix: &str) -> String {
    format!(
        "@@IMPORTS:{}\n{}",
        urlencoding::encode(prefix),
        END_MARKER
    )
}

/// 검색 경로 변경 요청. 경로들은 각각 `|`를 뒤에 붙여 이어붙인 다음
/// 통째로 퍼센트 인코딩한다 (예: `["/a", "/b"]` → `/a|/b|`).
pub fn encode_change_pythonpath(pythonpath: &[String]) -> String {
    let mut joined = String::new();
    for path in pythonpath {
        joined.push_str(path);
        joined.push('|');
    }
    format!(
        "@@CHANGE_PYTHONPATH:{}\n{}",
        urlencoding::encode(&joined),
        END_MARKER
    )
}

/// 정의 검색 요청: `@@SEARCH<enc "module.token">\nEND@@`
pub fn encode_search(qualified_token: &str) -> String {
    format!(
        "@@SEARCH{}\n{}",
        urlencoding::encode(qualified_token),
        END_MARKER
    )
}

/// 종료 마커가 나올 때까지 응답을 청크 단위로 읽어 페이로드를 돌려준다.
///
/// - 서버가 패딩으로 보내는 NUL 바이트는 제거한다.
/// - 진행 마커(`@@PROCESSING_END@@`, `@@PROCESSING:<enc>END@@`)는
///   진행 싱크에 보고하고 버퍼에서 제거하며, 유휴 카운터를 리셋한다.
/// - 데이터 없는 반복이 `idle_ceiling`번 누적되면 포기하고
///   [`ProtocolError::MissingTerminator`]를 돌려준다 (누적 페이로드 포함).
///
/// 반환되는 페이로드는 응답 타입 접두사(`@@COMPLETIONS`) 한 번과
/// 종료 마커 이후가 제거된 상태다. 소켓 타임아웃 등 I/O 오류는 그대로
/// 전파된다 — 복구는 셸 계층의 몫이다.
pub fn read_payload<R: Read>(
    reader: &mut R,
    progress: Option<&dyn ProgressSink>,
    idle_ceiling: u32,
    idle_poll: Duration,
) -> Result<String, ProtocolError> {
    let mut accumulated = String::new();
    let mut idle = 0u32;

    while idle < idle_ceiling {
        let mut buf = [0u8; BUFFER_SIZE];
        let n = reader.read(&mut buf)?;
        let mut chunk = String::from_utf8_lossy(&buf[..n]).into_owned();

        // 상세 없는 진행 마커
        if chunk.contains(PROCESSING_MARKER) {
            chunk = chunk.replace(PROCESSING_MARKER, "");
            idle = 0;
            report(progress, "Processing...");
        }

        // 상세 있는 진행 마커 — 이 청크의 나머지는 전부 버린다
        if chunk.contains(PROCESSING_DETAIL_PREFIX) {
            let detail = chunk
                .replace(PROCESSING_DETAIL_PREFIX, "")
                .replace(END_MARKER, "");
            idle = 0;
            let decoded = decode_lossy(&detail);
            if decoded.trim().is_empty() {
                report(progress, "Processing...");
            } else {
                report(progress, &format!("Processing: {}", decoded));
            }
            chunk.clear();
        }

        let chunk = chunk.replace('\0', "");
        let empty_iteration = chunk.is_empty();
        accumulated.push_str(&chunk);

        if accumulated.contains(END_MARKER) {
            break;
        }

        if empty_iteration {
            idle += 1;
        } else {
            // 데이터가 흐르는 동안에는 아무리 오래 걸려도 계속 기다린다
            idle = 0;
        }
        std::thread::sleep(idle_poll);
    }

    let stripped = accumulated.replacen(COMPLETIONS_PREFIX, "", 1);
    match stripped.find(END_MARKER) {
        Some(pos) => Ok(stripped[..pos].to_string()),
        None => Err(ProtocolError::MissingTerminator { payload: stripped }),
    }
}

/// 페이로드를 완성 레코드들로 파싱한다.
///
/// 괄호를 제거한 뒤 콤마로 나눈다. 첫 토큰은 항상 모듈/파일 이름이고,
/// 이후 토큰들은 최대 4개 단위(token, description, args, type)로 묶인다.
/// args/type이 없으면 각각 빈 문자열과 [`TYPE_UNKNOWN`]이 기본값.
/// description 없이 끝나는 그룹은 그 지점에서 파싱을 멈춘다.
/// `ERROR:` 센티널 토큰의 그룹은 결과에서 제외한다.
pub fn parse_completions(payload: &str) -> Completions {
    let stripped: String = payload.chars().filter(|c| *c != '(' && *c != ')').collect();
    let mut tokens = stripped.split(',');

    let file = match tokens.next() {
        Some(first) if !first.is_empty() => Some(decode_lossy(first)),
        _ => None,
    };

    let mut records = Vec::new();
    while let Some(raw_token) = tokens.next() {
        let token = decode_lossy(raw_token);
        let Some(raw_description) = tokens.next() else {
            break;
        };
        let description = decode_lossy(raw_description);
        let args = tokens
            .next()
            .map(decode_lossy)
            .unwrap_or_default();
        let typ = tokens
            .next()
            .map(decode_lossy)
            .unwrap_or_else(|| TYPE_UNKNOWN.to_string());

        if token == ERROR_SENTINEL {
            tracing::debug!(
                "completion shell error record dropped: {} / {} / {}",
                description,
                args,
                typ
            );
            continue;
        }
        records.push(CompletionRecord {
            token,
            description,
            args,
            typ,
        });
    }

    Completions { file, records }
}

fn report(progress: Option<&dyn ProgressSink>, description: &str) {
    if let Some(sink) = progress {
        sink.worked(description);
    }
}

/// 퍼센트 디코딩 — 깨진 인코딩은 원문 그대로 통과시킨다
fn decode_lossy(s: &str) -> String {
    match urlencoding::decode(s) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => s.to_string(),
    }
}
