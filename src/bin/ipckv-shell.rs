//! Interactive driver for poking at a shared table from several
//! terminals at once.

use anyhow::{bail, format_err, Error};
use rustyline::error::ReadlineError;
use rustyline::Editor;

use ipc_kv::IpcKv;

const USAGE: &str = "\
commands:
  set <key> <value>   insert or overwrite a key
  get <key>           look a key up
  remove <key>        remove a key
  clear               drop every entry
  size                number of entries
  print               dump the table
  quit
";

fn main() -> Result<(), Error> {
    env_logger::init();

    let table = match std::env::args().nth(1) {
        Some(name) => name,
        None => {
            bail!("usage: ipckv-shell <table-name>");
        }
    };

    let mut kv = IpcKv::open(&table)?;
    println!("attached to table '{}' - 'help' lists commands", table);

    let mut rl = Editor::<()>::new();
    loop {
        let line = match rl.readline("ipckv> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => return Err(err.into()),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        rl.add_history_entry(line);

        if let Err(err) = run_command(&mut kv, line) {
            eprintln!("error: {}", err);
        }
    }

    Ok(())
}

fn run_command(kv: &mut IpcKv, line: &str) -> Result<(), Error> {
    let mut parts = line.splitn(3, char::is_whitespace);
    let command = parts.next().unwrap_or("");

    match command {
        "set" => {
            let key = parts
                .next()
                .ok_or_else(|| format_err!("set needs a key"))?;
            let value = parts.next().unwrap_or("");
            kv.set(key, value.as_bytes())?;
        }
        "get" => {
            let key = parts
                .next()
                .ok_or_else(|| format_err!("get needs a key"))?;
            match kv.get(key)? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("(not found)"),
            }
        }
        "remove" => {
            let key = parts
                .next()
                .ok_or_else(|| format_err!("remove needs a key"))?;
            println!("{}", kv.remove(key)?);
        }
        "clear" => kv.clear()?,
        "size" => println!("{}", kv.size()?),
        "print" => kv.print()?,
        "help" => print!("{}", USAGE),
        "quit" | "exit" => std::process::exit(0),
        other => bail!("unknown command '{}' - try 'help'", other),
    }
    Ok(())
}
