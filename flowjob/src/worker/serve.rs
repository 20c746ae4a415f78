use std::io::{BufRead, Write};

use anyhow::Context;

use crate::job::JobRequest;

use super::handler::{ConversionPipeline, ExecutionHandler};

/// Serve newline-delimited [`JobRequest`]s until `input` reaches EOF,
/// writing one reply line per request. Returns the number of jobs served.
///
/// A request line that does not decode ends the loop with an error; the
/// parent sees the worker exit and treats its pool as broken.
pub fn serve<P, R, W>(handler: &ExecutionHandler<P>, input: R, mut output: W) -> anyhow::Result<usize>
where
    P: ConversionPipeline,
    R: BufRead,
    W: Write,
{
    let mut served = 0;
    for line in input.lines() {
        let line = line.context("reading job request")?;
        if line.trim().is_empty() {
            continue;
        }
        let request: JobRequest =
            serde_json::from_str(&line).context("decoding job request")?;

        let reply = handler.run(&request);
        serde_json::to_writer(&mut output, &reply).context("encoding job reply")?;
        output.write_all(b"\n")?;
        output.flush()?;
        served += 1;
    }
    tracing::debug!(served, "worker input closed");
    Ok(served)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{FailureKind, JobParams, JobReply, TaskId, WorkerContext};
    use crate::worker::SimulatedPipeline;
    use std::path::PathBuf;
    use std::time::Duration;

    fn request_line(task: &str) -> String {
        let request = JobRequest {
            task_id: TaskId::parse(task).unwrap(),
            files: vec![PathBuf::from("/captures/a.pcap")],
            output: "/out/a.ipfix".into(),
            params: JobParams::default(),
            context: WorkerContext {
                registry_path: PathBuf::from("/nonexistent/registry"),
                lock_timeout_ms: 10,
                completion_log_dir: None,
            },
        };
        serde_json::to_string(&request).unwrap()
    }

    #[test]
    fn one_reply_line_per_request() {
        let handler = ExecutionHandler::new(SimulatedPipeline::new(Duration::ZERO));
        let input = format!("{}\n\n{}\n", request_line("a"), request_line("b"));
        let mut output = Vec::new();

        let served = serve(&handler, input.as_bytes(), &mut output).unwrap();
        assert_eq!(served, 2);

        let replies: Vec<JobReply> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(replies.len(), 2);
        assert!(replies
            .iter()
            .all(|r| matches!(r, JobReply::Failed(f) if f.kind == FailureKind::Coordination)));
    }

    #[test]
    fn garbage_request_ends_the_loop() {
        let handler = ExecutionHandler::new(SimulatedPipeline::new(Duration::ZERO));
        let mut output = Vec::new();
        assert!(serve(&handler, "{not json\n".as_bytes(), &mut output).is_err());
        assert!(output.is_empty());
    }
}
