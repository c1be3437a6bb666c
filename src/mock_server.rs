use std::{
    io::{BufRead, BufReader, Write},
    net::TcpListener,
    thread::{self, JoinHandle},
    time::Duration,
};

const IDLE_LIMIT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct SessionLog {
    pub lines: Vec<String>,
    pub closed_by_client: bool,
}

pub struct MockServer {
    port: u16,
    handle: JoinHandle<SessionLog>,
}

impl MockServer {
    /// Answers the n-th received line with `replies[n]`; `None` leaves the
    /// request unanswered. Lines past the script are recorded but not answered.
    pub fn start(replies: Vec<Option<&'static str>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let mut log = SessionLog::default();
            let (stream, _) = listener.accept().unwrap();
            stream.set_read_timeout(Some(IDLE_LIMIT)).unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            let mut replies = replies.into_iter();
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) => {
                        log.closed_by_client = true;
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
                log.lines.push(line.trim_end_matches(['\r', '\n']).to_owned());
                if let Some(Some(reply)) = replies.next() {
                    // the client may already be gone
                    let _ = writer.write_all(format!("{reply}\n").as_bytes());
                }
            }
            log
        });
        Self { port, handle }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn finish(self) -> SessionLog {
        self.handle.join().unwrap()
    }
}
