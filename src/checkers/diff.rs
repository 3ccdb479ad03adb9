use async_trait::async_trait;

use super::Checker;
use crate::error::Result;
use crate::verdict;

/// Compares outputs after CRLF normalization and trailing whitespace trimming
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffChecker;

#[async_trait]
impl Checker for DiffChecker {
    async fn prepare(&self) -> Result<String> {
        Ok(String::new())
    }

    async fn run_checker(
        &self,
        program_output: &[u8],
        _test_input: &[u8],
        correct_output: &[u8],
    ) -> (String, f64) {
        if normalize(program_output) == normalize(correct_output) {
            (verdict::SUCCESS.to_string(), 100.0)
        } else {
            (verdict::WRONG.to_string(), 0.0)
        }
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

fn normalize(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut bytes = data.iter().peekable();
    while let Some(&b) = bytes.next() {
        if b == b'\r' && bytes.peek() == Some(&&b'\n') {
            continue;
        }
        out.push(b);
    }
    let len = out.trim_ascii_end().len();
    out.truncate(len);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trailing_whitespace_is_ignored() {
        let (msg, pct) = DiffChecker.run_checker(b"5\n", b"", b"5").await;
        assert_eq!(msg, verdict::SUCCESS);
        assert_eq!(pct, 100.0);
    }

    #[tokio::test]
    async fn test_wrong_answer() {
        let (msg, pct) = DiffChecker.run_checker(b"4\n", b"", b"5\n").await;
        assert_eq!(msg, verdict::WRONG);
        assert_eq!(pct, 0.0);
    }

    #[tokio::test]
    async fn test_crlf_is_normalized() {
        let (_, pct) = DiffChecker.run_checker(b"1 2\r\n3\r\n", b"", b"1 2\n3").await;
        assert_eq!(pct, 100.0);

        // Interior whitespace still matters
        let (_, pct) = DiffChecker.run_checker(b"1  2\n3", b"", b"1 2\n3").await;
        assert_eq!(pct, 0.0);
    }

    #[test]
    fn test_normalize_keeps_lone_carriage_return() {
        assert_eq!(normalize(b"a\rb\r\n\r\n  "), b"a\rb");
        assert_eq!(normalize(b""), b"");
    }
}
