//! 生命周期事件的SSE实时流
//!
//! 订阅事件总线的广播通道并转成SSE流；落后被挤出的订阅者只丢消息不断连，
//! 客户端可用`/api/v1/events`的历史接口补齐。

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use crate::handlers::AppContext;

/// GET /api/v1/events/stream
pub async fn event_stream(
    State(ctx): State<AppContext>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("新的SSE订阅者接入");
    let rx = ctx.events.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => Some(Ok(Event::default().event(event.status.as_str()).data(json))),
                Err(e) => {
                    warn!("事件序列化失败: {}", e);
                    None
                }
            },
            Err(e) => {
                // 订阅者落后于广播通道，丢弃并继续
                warn!("SSE流落后: {:?}", e);
                None
            }
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
