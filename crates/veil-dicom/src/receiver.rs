//! 简化的影像接收服务
//!
//! 真实的关联协商由外部传输层负责，这里实现喂给核心管线的接收面：
//! 长度前缀帧（4字节大端长度 + 16字节空格填充的发起方AE标题 + 完整DICOM对象），
//! 每帧应答2字节状态字。
//!
//! 状态字: `0x0000` 已接受，`0x0001` 策略拒绝，`0xC000` 数据集无法处理。

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, error, info, warn};

use crate::parser::DicomParser;
use crate::validator::DatasetValidator;
use veil_core::config::DicomConfig;
use veil_core::{AcceptResult, DicomDataset, Result, SessionMeta, VeilError};

/// 已接受
pub const STATUS_SUCCESS: u16 = 0x0000;
/// 策略拒绝（过滤、迟到等，非错误）
pub const STATUS_REJECTED: u16 = 0x0001;
/// 数据集无法解析或缺少必需标签
pub const STATUS_CANNOT_PROCESS: u16 = 0xC000;

/// AE标题字段的固定宽度
const AE_TITLE_LEN: usize = 16;
/// 单帧大小上限，防御异常的长度前缀
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// 管线接收实例的回调接口
///
/// 由管线引擎实现；接收服务对每个完整帧调用一次。
#[async_trait]
pub trait IngestSink: Send + Sync {
    async fn on_instance_received(
        &self,
        session: SessionMeta,
        dataset: DicomDataset,
    ) -> AcceptResult;
}

/// 一个完整接收的帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFrame {
    pub calling_ae_title: String,
    pub data: Vec<u8>,
}

/// 帧解码器
#[derive(Debug, Default)]
pub struct StoreFrameCodec;

impl Decoder for StoreFrameCodec {
    type Item = StoreFrame;
    type Error = VeilError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let payload_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if payload_len < AE_TITLE_LEN || payload_len > MAX_FRAME_LEN {
            return Err(VeilError::Dicom(format!("非法帧长度: {}", payload_len)));
        }
        if src.len() < 4 + payload_len {
            // 预留空间，等待剩余字节
            src.reserve(4 + payload_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let payload = src.split_to(payload_len);
        let calling_ae_title = String::from_utf8_lossy(&payload[..AE_TITLE_LEN])
            .trim()
            .to_string();

        Ok(Some(StoreFrame {
            calling_ae_title,
            data: payload[AE_TITLE_LEN..].to_vec(),
        }))
    }
}

/// 为对端编码一帧，主要用于测试与本地工具
pub fn encode_frame(calling_ae_title: &str, data: &[u8]) -> Vec<u8> {
    let mut ae = format!("{:<width$}", calling_ae_title, width = AE_TITLE_LEN);
    ae.truncate(AE_TITLE_LEN);

    let payload_len = AE_TITLE_LEN + data.len();
    let mut frame = Vec::with_capacity(4 + payload_len);
    frame.extend_from_slice(&(payload_len as u32).to_be_bytes());
    frame.extend_from_slice(ae.as_bytes());
    frame.extend_from_slice(data);
    frame
}

/// 影像接收服务
pub struct StoreServer {
    config: DicomConfig,
    sink: Arc<dyn IngestSink>,
}

impl StoreServer {
    pub fn new(config: DicomConfig, sink: Arc<dyn IngestSink>) -> Self {
        Self { config, sink }
    }

    /// 启动接收循环
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("影像接收服务启动: AE={}, 地址={}", self.config.ae_title, addr);

        loop {
            match listener.accept().await {
                Ok((stream, remote_addr)) => {
                    debug!("接受连接: {}", remote_addr);
                    let sink = Arc::clone(&self.sink);
                    let called_ae = self.config.ae_title.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, remote_addr, called_ae, sink).await
                        {
                            error!("处理连接失败: {}: {}", remote_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("接受连接失败: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    called_ae_title: String,
    sink: Arc<dyn IngestSink>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, StoreFrameCodec);

    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!("连接 {} 帧解码失败: {}", remote_addr, e);
                break;
            }
        };

        let status = process_frame(&frame, &remote_addr, &called_ae_title, sink.as_ref()).await;
        write_half.write_all(&status.to_be_bytes()).await?;
    }

    debug!("连接关闭: {}", remote_addr);
    Ok(())
}

async fn process_frame(
    frame: &StoreFrame,
    remote_addr: &SocketAddr,
    called_ae_title: &str,
    sink: &dyn IngestSink,
) -> u16 {
    let parsed = match DicomParser::parse_bytes(&frame.data) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("来自 {} 的数据集无法解析: {}", frame.calling_ae_title, e);
            return STATUS_CANNOT_PROCESS;
        }
    };

    if let Err(e) = DatasetValidator::validate(&parsed.dataset) {
        warn!("来自 {} 的数据集校验失败: {}", frame.calling_ae_title, e);
        return STATUS_CANNOT_PROCESS;
    }

    let session = SessionMeta {
        calling_ae_title: frame.calling_ae_title.clone(),
        called_ae_title: called_ae_title.to_string(),
        transfer_syntax_uid: Some(parsed.transfer_syntax_uid.clone()),
        remote_addr: Some(remote_addr.to_string()),
    };

    match sink.on_instance_received(session, parsed.dataset).await {
        AcceptResult::Accepted { .. } => STATUS_SUCCESS,
        AcceptResult::Rejected { reason } => {
            debug!(
                "实例被策略拒绝: {} ({})",
                frame.calling_ae_title,
                reason.code()
            );
            STATUS_REJECTED
        }
    }
}
