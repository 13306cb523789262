use crate::error::{ChatError, Result};
use crate::extract::{reply_id, ReplyExtractor};
use crate::models::{AppConfig, Assistant, BackendKind};
use crate::sse::{FrameDecoder, ServerEvent};
use futures_util::StreamExt; // 用于处理流式数据
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 后端 HTTP 客户端。显式构造、显式传入，不做全局缓存。
#[derive(Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    request_timeout: Duration,
}

impl ChatClient {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    /// 发起流式请求，返回已确认 2xx 的响应（响应体尚未读取）。
    pub async fn open_stream(
        &self,
        url: &str,
        body: &impl Serialize,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let send = self
            .http
            .post(url)
            .header("Accept", "text/event-stream")
            .json(body)
            .send();
        let response = cancellable(cancel, async { Ok::<_, ChatError>(send.await?) }).await?;
        ensure_success(response).await
    }

    /// 一次性 JSON 请求，用于 webhook 与 Responses 代理。
    pub async fn post_json(
        &self,
        url: &str,
        body: &impl Serialize,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let send = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .json(body)
            .send();
        cancellable(cancel, async {
            let response = ensure_success(send.await?).await?;
            Ok::<_, ChatError>(response.json::<Value>().await?)
        })
        .await
    }

    /// 查询 MCP 桥接暴露的工具数量。端点应返回工具数组，其它形状计为 0。
    pub async fn tool_count(&self, url: &str) -> Result<usize> {
        let response = self
            .http
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await?;
        let tools = ensure_success(response).await?.json::<Value>().await?;
        let count = tools.as_array().map(Vec::len).unwrap_or_else(|| {
            debug!(target: "aio_chat::transport", "{} did not return a tool array", url);
            0
        });
        Ok(count)
    }
}

/// 在每个挂起点检查取消令牌。
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ChatError::Cancelled),
        r = fut => r,
    }
}

/// 非 2xx 时优先使用错误体里的 `error` 字段，否则为 `Error: <状态码>`。
async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| format!("Error: {}", status.as_u16()));
    error!(target: "aio_chat::transport", "backend returned {}: {}", status, message);
    Err(ChatError::Status {
        status: status.as_u16(),
        message,
    })
}

/// 某个助手实际使用的后端及其请求方式。
#[derive(Clone, Debug)]
pub enum TurnBackend {
    Stream {
        url: String,
    },
    Webhook {
        url: String,
        input_field: String,
        extractor: ReplyExtractor,
    },
    Responses {
        url: String,
        extractor: ReplyExtractor,
    },
}

impl TurnBackend {
    pub fn resolve(assistant: &Assistant, config: &AppConfig) -> Self {
        match &assistant.backend {
            BackendKind::AssistantStream { url } => TurnBackend::Stream {
                url: url.clone().unwrap_or_else(|| config.api_url.clone()),
            },
            BackendKind::Webhook {
                url,
                input_field,
                extract,
                ..
            } => TurnBackend::Webhook {
                url: url.clone(),
                input_field: input_field.clone(),
                extractor: ReplyExtractor::from_config(extract),
            },
            BackendKind::Responses { url } => TurnBackend::Responses {
                url: url.clone(),
                extractor: ReplyExtractor::responses(),
            },
        }
    }
}

/// 一轮对话发给后端的内容。
#[derive(Serialize, Clone, Debug)]
pub struct TurnRequest {
    #[serde(rename = "assistantId")]
    pub assistant_id: String,
    pub message: String,
    #[serde(rename = "imageBase64")]
    pub image_base64: Option<String>,
    #[serde(rename = "threadId")]
    pub thread_id: Option<String>,
}

/// 传输任务回送给会话的信号。
#[derive(Debug)]
pub enum TurnSignal {
    Event(ServerEvent),
    Failed(ChatError),
    /// 字节流正常关闭。
    Closed,
}

/// 带轮次编号的信号，会话据此丢弃已被取代的轮次。
#[derive(Debug)]
pub struct Inbound {
    pub turn: u64,
    pub signal: TurnSignal,
}

/// 传输任务：发请求、解码、把事件按到达顺序送进收件箱。
///
/// 取消后立即返回，不再发送任何信号。
pub async fn run_turn(
    client: ChatClient,
    backend: TurnBackend,
    request: TurnRequest,
    cancel: CancellationToken,
    inbox: UnboundedSender<Inbound>,
    turn: u64,
) {
    let send = |signal: TurnSignal| {
        // 会话已关闭时接收端不存在，忽略即可
        let _ = inbox.send(Inbound { turn, signal });
    };

    let result = match &backend {
        TurnBackend::Stream { url } => {
            stream_turn(&client, url, &request, &cancel, &send).await
        }
        TurnBackend::Webhook {
            url,
            input_field,
            extractor,
        } => {
            let mut body = serde_json::Map::new();
            body.insert(input_field.clone(), Value::String(request.message.clone()));
            one_shot_turn(&client, url, &Value::Object(body), extractor, false, &cancel, &send).await
        }
        TurnBackend::Responses { url, extractor } => {
            let body = json!({
                "userMessage": request.message,
                "previousResponseId": request.thread_id,
            });
            one_shot_turn(&client, url, &body, extractor, true, &cancel, &send).await
        }
    };

    match result {
        Ok(()) => send(TurnSignal::Closed),
        Err(ChatError::Cancelled) => {
            debug!(target: "aio_chat::transport", "turn {} cancelled", turn);
        }
        Err(e) => {
            warn!(target: "aio_chat::transport", "turn {} failed: {}", turn, e);
            send(TurnSignal::Failed(e));
        }
    }
}

async fn stream_turn(
    client: &ChatClient,
    url: &str,
    request: &TurnRequest,
    cancel: &CancellationToken,
    send: &impl Fn(TurnSignal),
) -> Result<()> {
    info!(
        target: "aio_chat::transport",
        "POST {} assistant={} image={} thread={:?}",
        url,
        request.assistant_id,
        request.image_base64.is_some(),
        request.thread_id
    );
    let response = client.open_stream(url, request, cancel).await?;

    // 获取响应字节流
    let mut stream = response.bytes_stream();
    let mut decoder = FrameDecoder::new();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            next = stream.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                for frame in decoder.push(&chunk) {
                    send(TurnSignal::Event(ServerEvent::from_value(frame)));
                }
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                decoder.finish();
                return Ok(());
            }
        }
    }
}

/// 非流式后端：拿到整段回复后，按流式后端的事件顺序重放给状态机。
async fn one_shot_turn(
    client: &ChatClient,
    url: &str,
    body: &Value,
    extractor: &ReplyExtractor,
    chained: bool,
    cancel: &CancellationToken,
    send: &impl Fn(TurnSignal),
) -> Result<()> {
    info!(target: "aio_chat::transport", "POST {} (one-shot)", url);
    let data = client.post_json(url, body, cancel).await?;

    let text = extractor.extract(&data);
    let id = reply_id(&data);
    debug!(target: "aio_chat::transport", "one-shot reply: {} chars, id={:?}", text.len(), id);

    if chained {
        if let Some(id) = &id {
            send(TurnSignal::Event(ServerEvent::thread_updated(id.clone())));
        }
    }
    send(TurnSignal::Event(ServerEvent::delta(text)));
    send(TurnSignal::Event(ServerEvent::completed(id)));
    send(TurnSignal::Event(ServerEvent::run_completed()));
    send(TurnSignal::Event(ServerEvent::stream_ended(None)));
    Ok(())
}
