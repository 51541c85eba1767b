use crate::context::MessageProcessingContext;
use crate::error::Result;
use crate::sink::Sink;
use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt, Stdout};
use tokio::sync::Mutex;

/// Writes every message as one line of JSON
pub struct LineWriterSink<W> {
    writer: Mutex<W>,
}

impl LineWriterSink<Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W: AsyncWrite + Unpin + Send> LineWriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Sink for LineWriterSink<W> {
    async fn process(&self, ctx: &MessageProcessingContext) -> Result<()> {
        let mut line = ctx.message().to_line();
        line.push('\n');
        self.writer.lock().await.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.writer.lock().await.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StreamProcessingContext;
    use crate::types::{Message, MessageAndRouting};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_writes_one_line_per_message() {
        let stream = Arc::new(StreamProcessingContext::new("tester"));
        let sink = LineWriterSink::new(Vec::new());

        for n in 1..=2 {
            let ctx = MessageProcessingContext::new(
                stream.clone(),
                MessageAndRouting::new(Message::from_json(json!({"n": n})).unwrap(), "main"),
            );
            sink.process(&ctx).await.unwrap();
        }
        sink.close().await.unwrap();

        let output = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(output, "{\"n\":1}\n{\"n\":2}\n");
    }
}
