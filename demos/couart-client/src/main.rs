//! Small CoAP client for the shell.
//!
//! ```text
//! couart-client GET coap+uart://ttyUSB0/sensors/temperature
//! couart-client --con GET coap+uart://any/status
//! couart-client POST coap+uart://COM3/actuators/led on
//! couart-client --observe coap+uart://ttyUSB0/sensors/door
//! couart-client PING coap+uart://ttyUSB0
//! ```

use std::env;
use std::io::Read;
use std::process::ExitCode;
use std::time::Duration;

use couart::{Body, Client, Method, Request, Response};
use log::info;

const TEXT_PLAIN: u16 = 0;

fn usage() -> ExitCode {
    eprintln!("usage: couart-client [--con] [--timeout <secs>] <METHOD> <URL> [payload]");
    eprintln!("       couart-client [--timeout <secs>] --observe <URL>");
    ExitCode::FAILURE
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let mut confirmable = false;
    let mut observe = false;
    let mut timeout = Some(Duration::from_secs(30));
    let mut positional = Vec::new();

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--con" => confirmable = true,
            "--observe" => observe = true,
            "--timeout" => match args.next().and_then(|s| s.parse::<u64>().ok()) {
                Some(0) => timeout = None,
                Some(secs) => timeout = Some(Duration::from_secs(secs)),
                None => return usage(),
            },
            _ => positional.push(arg),
        }
    }

    let mut client = Client::new();
    client.timeout = timeout;

    if observe {
        let [url] = positional.as_slice() else {
            return usage();
        };
        return run_observe(&client, url).await;
    }

    let (method, url, payload) = match positional.as_slice() {
        [method, url] => (method, url, None),
        [method, url, payload] => (method, url, Some(payload.clone())),
        _ => return usage(),
    };
    let Ok(method) = method.parse::<Method>() else {
        eprintln!("invalid method: {method}");
        return usage();
    };

    let body = match payload {
        Some(data) => Body::bytes(data),
        None => Body::empty(),
    };
    let mut req = match Request::new(method, url, body) {
        Ok(req) => req,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    req.confirmable = confirmable || method == Method::Ping;
    if matches!(method, Method::Post | Method::Put) {
        req.options
            .set_uint(couart::msg::OptionNumber::CONTENT_FORMAT, TEXT_PLAIN.into());
    }

    match client.send(req).await {
        Ok(res) => {
            print_response(res);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run_observe(client: &Client, url: &str) -> ExitCode {
    let mut res = match client.observe(url).await {
        Ok(res) => res,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    info!("observation established, ctrl-c to stop");
    print_response_ref(&mut res);

    loop {
        tokio::select! {
            next = res.next() => match next {
                Some(notification) => print_response(notification),
                None => {
                    info!("notification stream closed");
                    return ExitCode::SUCCESS;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("cancelling observation");
                match client.cancel_observe(&res).await {
                    Ok(last) => print_response(last),
                    Err(err) => eprintln!("cancel failed: {err}"),
                }
                return ExitCode::SUCCESS;
            }
        }
    }
}

fn print_response(mut res: Response) {
    print_response_ref(&mut res);
}

fn print_response_ref(res: &mut Response) {
    let mut payload = Vec::new();
    if let Err(err) = res.body.read_to_end(&mut payload) {
        eprintln!("failed to read body: {err}");
        return;
    }
    println!("{}", res.status);
    if !payload.is_empty() {
        println!("{}", String::from_utf8_lossy(&payload));
    }
}
