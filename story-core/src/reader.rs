//! Reassembling a streamed response.

use futures::{pin_mut, Stream, StreamExt};
use ollama::GenerateChunk;

/// Drain `stream`, forwarding each token to `sink` and returning the full text.
///
/// Reading continues until the stream closes, even after a `done` record.
/// The first transport error ends the read and is returned; tokens already
/// passed to `sink` stay delivered.
pub async fn read_response<S, F>(stream: S, mut sink: F) -> Result<String, ollama::Error>
where
    S: Stream<Item = Result<GenerateChunk, ollama::Error>>,
    F: FnMut(&str),
{
    pin_mut!(stream);

    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if let Some(token) = chunk.token() {
            sink(token);
            text.push_str(token);
        }
    }

    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use ollama::decode_ndjson;

    fn byte_stream(
        parts: Vec<Result<&'static str, &'static str>>,
    ) -> impl Stream<Item = Result<Vec<u8>, &'static str>> + Send {
        stream::iter(parts.into_iter().map(|p| p.map(|s| s.as_bytes().to_vec())))
    }

    #[tokio::test]
    async fn test_accumulates_and_skips_garbage() {
        let source = byte_stream(vec![Ok(
            "{\"response\":\"A\"}\n{\"response\":\"B\"}\ngarbage\n{\"response\":\"C\"}\n",
        )]);

        let mut seen = Vec::new();
        let text = read_response(decode_ndjson(source), |t| seen.push(t.to_string()))
            .await
            .unwrap();

        assert_eq!(text, "ABC");
        assert_eq!(seen, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_reads_past_done_marker() {
        let source = byte_stream(vec![
            Ok("{\"response\":\"Once\",\"done\":false}\n"),
            Ok("{\"response\":\"\",\"done\":true}\n"),
            Ok("{\"response\":\" more\"}"),
        ]);

        let text = read_response(decode_ndjson(source), |_| {}).await.unwrap();
        assert_eq!(text, "Once more");
    }

    #[tokio::test]
    async fn test_record_split_across_chunks() {
        let source = byte_stream(vec![Ok("{\"respo"), Ok("nse\":\"霧\"}\n{\"response\":\"中\"}\n")]);

        let mut calls = 0;
        let text = read_response(decode_ndjson(source), |_| calls += 1)
            .await
            .unwrap();

        assert_eq!(text, "霧中");
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn test_transport_error_keeps_delivered_tokens() {
        let source = byte_stream(vec![
            Ok("{\"response\":\"Half\"}\n"),
            Err("connection reset"),
            Ok("{\"response\":\"never\"}\n"),
        ]);

        let mut seen = String::new();
        let result = read_response(decode_ndjson(source), |t| seen.push_str(t)).await;

        assert!(matches!(result, Err(ollama::Error::Network(_))));
        assert_eq!(seen, "Half");
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let source = byte_stream(Vec::new());
        let text = read_response(decode_ndjson(source), |_| {}).await.unwrap();
        assert!(text.is_empty());
    }
}
