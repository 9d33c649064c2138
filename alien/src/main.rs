use clap::{Parser as ClapParser, ValueEnum};
use std::{fs, process};

use alien::{
    BackendKind, CallConvention, Context, ContextCreateInfo, Library, Result, StructOptions, Value,
    parse_list,
};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BackendArg {
    Libffi,
    Stack,
}

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Shared library to bind functions from (default: the running process)
    #[arg(short, long, help = "Shared library path")]
    library: Option<String>,

    /// Declaration file, one `alias`/`enum`/`struct`/`union`/`prototype`/
    /// `function` declaration per line
    #[arg(short, long, help = "Declarations to load before calling")]
    declarations: Option<String>,

    #[arg(long, value_enum, default_value = "libffi", help = "Call backend")]
    backend: BackendArg,

    /// Command to invoke after loading declarations
    #[arg(required = true, help = "Function to call")]
    function: String,

    #[arg(help = "Arguments passed to the function")]
    args: Vec<String>,
}

fn load_declarations(ctx: &Context, library: &std::sync::Arc<Library>, source: &str) -> Result<()> {
    for (lineno, line) in source.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let words: Vec<Value> = parse_list(line)?.into_iter().map(Value::from).collect();
        let at_line = format!("line {}:", lineno + 1);
        let word = |i: usize| words.get(i).cloned().unwrap_or(Value::Empty);
        let name = word(1).to_string();
        let done = match word(0).to_string().as_str() {
            "alias" => ctx.alias_define(&name, &word(2)),
            "enum" => ctx.define_enum(&name, &word(2)).map(drop),
            "struct" => ctx.define_struct(&name, &word(2), StructOptions::default()).map(drop),
            "union" => ctx.define_union(&name, &word(2), StructOptions::default()).map(drop),
            "prototype" => ctx
                .define_prototype(&name, &word(2), &word(3), CallConvention::Default)
                .map(drop),
            "function" => ctx
                .define_function(library, &name, None, &word(2), &word(3), CallConvention::Default)
                .map(drop),
            other => Err(alien::AlienError::invalid(format!("Unknown declaration \"{other}\"."))),
        };
        done.map_err(|e| e.context(&at_line))?;
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<Value> {
    let ctx = Context::new(ContextCreateInfo {
        backend: match cli.backend {
            BackendArg::Libffi => BackendKind::Libffi,
            BackendArg::Stack => BackendKind::Stack,
        },
        ..Default::default()
    });
    let library = match &cli.library {
        Some(path) => Library::load(path)?,
        None => Library::this()?,
    };
    if let Some(path) = &cli.declarations {
        let source = fs::read_to_string(path)
            .map_err(|e| alien::AlienError::not_found("File", &format!("{path} ({e})")))?;
        load_declarations(&ctx, &library, &source)?;
    }
    let args: Vec<Value> = cli.args.iter().map(|a| Value::from(a.as_str())).collect();
    ctx.invoke(&Value::from(cli.function.as_str()), &args)
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(value) => println!("{value}"),
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(1);
        }
    }
}
