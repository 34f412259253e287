//! Log volume checks: one warning per failed connect, one line per close

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use portrelay::config::{Route, Target, TargetAddr};
use portrelay::metrics::RelayStats;
use portrelay::relay::{CloseReason, Session, SessionSettings, Side, Transport};
use tokio::net::{TcpListener, TcpStream};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

/// Records the level and target of every event
#[derive(Clone, Default)]
struct EventLog {
    events: Arc<Mutex<Vec<(Level, String)>>>,
}

impl EventLog {
    fn count(&self, level: Level) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == level)
            .count()
    }

    fn count_from(&self, target: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, t)| t == target)
            .count()
    }
}

impl<S: Subscriber> Layer<S> for EventLog {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        self.events
            .lock()
            .unwrap()
            .push((*meta.level(), meta.target().to_string()));
    }
}

async fn client_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (user, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (user.unwrap(), accepted.unwrap().0)
}

#[tokio::test]
async fn test_refused_target_logs_one_warning() {
    let log = EventLog::default();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(log.clone()));

    let refused_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let route = Arc::new(Route {
        listen_port: 9000,
        target: Target::new(TargetAddr::Ipv4(Ipv4Addr::LOCALHOST), refused_port),
    });

    let (_user, accepted) = client_pair().await;
    let stats = Arc::new(RelayStats::new().unwrap());
    let session = Session::new(accepted, route, SessionSettings::default(), stats).unwrap();

    let outcome = session.run().await;
    assert_eq!(outcome.reason, CloseReason::ConnectFailed);

    assert_eq!(log.count(Level::WARN), 1);
    assert_eq!(log.count(Level::ERROR), 0);
    // Only the client transport existed, and it was closed once
    assert_eq!(log.count_from("portrelay::relay::transport"), 1);
}

#[tokio::test]
async fn test_repeated_close_logs_once() {
    let log = EventLog::default();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(log.clone()));

    let (_user, accepted) = client_pair().await;
    let mut transport = Transport::new(accepted, Side::Client).unwrap();

    transport.close().await;
    transport.close().await;
    transport.close().await;

    assert!(transport.is_closed());
    assert_eq!(log.count_from("portrelay::relay::transport"), 1);
    assert_eq!(log.count(Level::WARN), 0);
}
