use async_trait::async_trait;
use remex::{
    rpc::{reply, Args, CallError, Dispatch, ErrorKind, RemoteError, Serving, Skeleton, Stage, Stub},
    verbs, Cfg,
};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};

verbs! {
    enum CalcVerb {
        Add => "add",
        Divide => "divide",
        Explode => "explode",
        Nap => "nap",
    }
}

struct Calc;

#[async_trait]
impl Dispatch for Calc {
    type Verb = CalcVerb;

    async fn invoke(&self, verb: CalcVerb, mut args: Args) -> Result<Value, RemoteError> {
        match verb {
            CalcVerb::Add => {
                let a: i64 = args.next("a")?;
                let b: i64 = args.next("b")?;
                reply(a + b)
            }
            CalcVerb::Divide => {
                let a: i64 = args.next("a")?;
                let b: i64 = args.next("b")?;
                if b == 0 {
                    return Err(
                        RemoteError::new(ErrorKind::Other("DivisionByZero".into()), "division by zero").with_payload(a)
                    );
                }
                reply(a / b)
            }
            CalcVerb::Explode => panic!("boom"),
            CalcVerb::Nap => {
                let millis: u64 = args.next("millis")?;
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(Value::Null)
            }
        }
    }
}

async fn serve(cfg: Cfg) -> (Serving, Stub) {
    let skeleton = Skeleton::bind("127.0.0.1:0", cfg.clone()).await.unwrap();
    let stub = Stub::new(skeleton.local_addr().into(), cfg);
    (skeleton.spawn(Arc::new(Calc)), stub)
}

#[tokio::test]
async fn call_returns_result() {
    crate::init();
    let (_serving, stub) = serve(crate::cfg()).await;

    println!("Calling add");
    let sum: i64 = stub.call_as("add", vec![json!(2), json!(40)]).await.unwrap();
    assert_eq!(sum, 42);

    let quotient = stub.call("divide", vec![json!(9), json!(3)]).await.unwrap();
    assert_eq!(quotient, json!(3));
}

#[tokio::test]
async fn remote_error_keeps_name_and_payload() {
    crate::init();
    let (_serving, stub) = serve(crate::cfg()).await;

    match stub.call("divide", vec![json!(7), json!(0)]).await {
        Err(CallError::Remote(err)) => {
            println!("Received {}", &err);
            assert_eq!(err.kind, ErrorKind::Other("DivisionByZero".into()));
            assert_eq!(err.message, "division by zero");
            assert_eq!(err.payload, vec![json!(7)]);
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[tokio::test]
async fn unknown_method_is_rejected() {
    crate::init();
    let (_serving, stub) = serve(crate::cfg()).await;

    let err = stub.call("__del__", vec![]).await.unwrap_err();
    assert_eq!(err.remote().map(|err| &err.kind), Some(&ErrorKind::UnknownMethod));
}

#[tokio::test]
async fn wrong_arguments_are_rejected() {
    crate::init();
    let (_serving, stub) = serve(crate::cfg()).await;

    let err = stub.call("add", vec![json!(1)]).await.unwrap_err();
    assert_eq!(err.remote().map(|err| &err.kind), Some(&ErrorKind::InvalidArguments));

    let err = stub.call("add", vec![json!("one"), json!(2)]).await.unwrap_err();
    assert_eq!(err.remote().map(|err| &err.kind), Some(&ErrorKind::InvalidArguments));
}

#[tokio::test]
async fn panic_is_reported_and_server_survives() {
    crate::init();
    let (_serving, stub) = serve(crate::cfg()).await;

    let err = stub.call("explode", vec![]).await.unwrap_err();
    let remote = err.remote().unwrap();
    assert_eq!(remote.kind, ErrorKind::Panicked);
    assert_eq!(remote.message, "boom");

    println!("Calling after panic");
    let sum: i64 = stub.call_as("add", vec![json!(1), json!(1)]).await.unwrap();
    assert_eq!(sum, 2);
}

#[tokio::test]
async fn malformed_request_is_answered() {
    crate::init();
    let (serving, _stub) = serve(crate::cfg()).await;

    let mut stream = TcpStream::connect(serving.local_addr()).await.unwrap();
    stream.write_all(b"this is not json\n").await.unwrap();
    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line).await.unwrap();
    println!("Received {}", line.trim_end());

    let response: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(response["error"]["name"], json!("MalformedRequest"));
    assert!(response["error"]["args"][0].is_string());
}

#[tokio::test]
async fn unreachable_endpoint_is_transport_error() {
    crate::init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let stub = Stub::new(addr.into(), crate::cfg());
    match stub.call("add", vec![json!(1), json!(2)]).await {
        Err(CallError::Transport(err)) => {
            println!("Received {}", &err);
            assert_eq!(err.stage, Stage::Connect);
            assert!(!err.maybe_delivered());
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[tokio::test]
async fn slow_response_times_out() {
    crate::init();
    let cfg = Cfg { response_timeout: Some(Duration::from_millis(100)), ..crate::cfg() };
    let (_serving, stub) = serve(cfg).await;

    let err = stub.call("nap", vec![json!(2000)]).await.unwrap_err();
    assert!(err.is_unreachable());
    match err {
        CallError::Transport(err) => assert!(err.maybe_delivered()),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn bounded_handlers_serve_concurrent_calls() {
    crate::init();
    let cfg = Cfg { max_handlers: Some(1), ..crate::cfg() };
    let (_serving, stub) = serve(cfg).await;

    let calls = (0..4).map(|i| {
        let stub = stub.clone();
        async move { stub.call_as::<i64>("add", vec![json!(i), json!(i)]).await.unwrap() }
    });
    let sums = futures::future::join_all(calls).await;
    assert_eq!(sums, vec![0, 2, 4, 6]);
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    crate::init();
    let (serving, stub) = serve(crate::cfg()).await;
    serving.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = stub.call("add", vec![json!(1), json!(2)]).await.unwrap_err();
    assert!(err.is_unreachable());
}
