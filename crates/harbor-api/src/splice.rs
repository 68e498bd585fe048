//! Joining a call to a line end

use crate::call::{Call, CallReceiver, CallSender};
use crate::error::ApiError;
use harbor_crane::{LineEnd, StreamEvent};
use harbor_proto::ApiMsgType;
use tokio::sync::mpsc;
use tracing::trace;

/// Carry `DATA` frames of `call` as containers on `end` and back, until either
/// side finishes. The other side is then closed as well.
pub async fn splice(call: Call, end: LineEnd) {
    let call_id = call.id();
    let (sender, receiver) = call.into_split();
    let (to_line, from_line) = end.into_split();

    tokio::join!(
        call_to_line(receiver, to_line),
        line_to_call(from_line, sender),
    );
    trace!(call_id, "Splice finished");
}

async fn call_to_line(mut receiver: CallReceiver, to_line: mpsc::Sender<StreamEvent>) {
    let last = loop {
        let Some(mut msg) = receiver.recv().await else {
            break StreamEvent::End;
        };
        match msg.msg_type {
            ApiMsgType::Data => {
                if msg.payload.is_empty() {
                    continue;
                }
                if to_line.send(StreamEvent::Data(msg.payload)).await.is_err() {
                    return;
                }
            }
            ApiMsgType::Err => {
                let reason = String::from_utf8_lossy(&msg.data()).into_owned();
                break StreamEvent::Error(reason);
            }
            _ => break StreamEvent::End,
        }
    };
    let _ = to_line.send(last).await;
}

async fn line_to_call(mut from_line: mpsc::Receiver<StreamEvent>, sender: CallSender) {
    loop {
        match from_line.recv().await.unwrap_or(StreamEvent::End) {
            StreamEvent::Data(c) => {
                if sender.send_data(c).await.is_err() {
                    break;
                }
            }
            StreamEvent::End => break,
            StreamEvent::Error(reason) => {
                let _ = sender.send_err(&ApiError::Remote(reason)).await;
                break;
            }
        }
    }
    sender.end().await;
}
