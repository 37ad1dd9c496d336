use anyhow::{Context, Result};
use clap::Parser;
use poeta_eval::{
    load_description_dict, make_table, simple_evaluate, Backend, ConversationTemplate, EvalConfig,
    PromptMode, RunConfig, ALL_TASKS, DEFAULT_BOOTSTRAP_ITERS, DEFAULT_FEWSHOT_SEED,
};
use poeta_inference::{cache_dir, get_backend, parse_model_args, CachingBackend, DEFAULT_CACHE_ROOT};
use poeta_logging::{logging, LogOutput};
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "poeta")]
#[command(about = "Few-shot evaluation of language models on Portuguese benchmarks")]
struct Args {
    /// Backend name, e.g. dummy, openai, maritalk, vllm
    #[arg(long)]
    model: String,

    /// Backend arguments as key=value,key=value
    #[arg(long = "model_args", default_value = "")]
    model_args: String,

    /// Comma-separated task names, or all_tasks
    #[arg(long, default_value = ALL_TASKS)]
    tasks: String,

    #[arg(long = "num_fewshot", default_value_t = 0)]
    num_fewshot: usize,

    /// Comma-separated: fixed, dynamic-random, dynamic-similar, manual
    #[arg(long = "prompt_modes", default_value = "dynamic-random")]
    prompt_modes: String,

    /// Requests per backend call, and requests in flight for API backends
    #[arg(long = "batch_size")]
    batch_size: Option<usize>,

    /// Only for testing; metrics over a limited run are not comparable
    #[arg(long)]
    limit: Option<usize>,

    #[arg(long = "no_cache", default_value_t = false)]
    no_cache: bool,

    /// Results JSON; sample logs are written next to it
    #[arg(long = "output_path")]
    output_path: Option<PathBuf>,

    /// JSON object of task name -> description
    #[arg(long = "description_dict_path")]
    description_dict_path: Option<PathBuf>,

    /// chatgpt or chatml
    #[arg(long = "conversation_template")]
    conversation_template: Option<String>,

    #[arg(long = "prompt_as_single_user_message", default_value_t = false)]
    prompt_as_single_user_message: bool,

    #[arg(long = "check_integrity", default_value_t = false)]
    check_integrity: bool,

    /// Root of the <dataset>/<split>.jsonl files
    #[arg(long = "data_dir", env = "POETA_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Seed of the exemplar samplers
    #[arg(long, default_value_t = DEFAULT_FEWSHOT_SEED)]
    seed: u64,

    #[arg(long = "bootstrap_iters", default_value_t = DEFAULT_BOOTSTRAP_ITERS)]
    bootstrap_iters: usize,

    #[arg(long = "cache_dir", default_value = DEFAULT_CACHE_ROOT)]
    cache_dir: PathBuf,

    #[arg(long = "log-output", value_enum, default_value_t = LogOutput::Console)]
    log_output: LogOutput,

    #[arg(long = "log-level", default_value_t = Level::INFO)]
    log_level: Level,

    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,

    /// Hide progress bars
    #[arg(long, default_value_t = false)]
    quiet: bool,
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Directory holding `output_path`; `.` for a bare file name.
fn output_dir(output_path: &Path) -> PathBuf {
    match output_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_owned(),
        _ => PathBuf::from("."),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    logging()
        .with_output(args.log_output)
        .with_level(args.log_level)
        .with_log_file(args.log_file.clone())
        .init()?;

    if args.limit.is_some() {
        warn!("--limit should only be used for testing, real metrics should not be computed with a limit");
    }

    let task_names = split_list(&args.tasks);
    let prompt_modes = split_list(&args.prompt_modes)
        .iter()
        .map(|mode| mode.parse::<PromptMode>())
        .collect::<Result<Vec<_>, _>>()?;
    let description_dict = match &args.description_dict_path {
        Some(path) => load_description_dict(path)?,
        None => Default::default(),
    };
    let conversation_template = args
        .conversation_template
        .as_deref()
        .map(str::parse::<ConversationTemplate>)
        .transpose()?;

    let model_args = parse_model_args(&args.model_args)?;
    let backend = get_backend(&args.model, &model_args, args.batch_size)?;
    let mut backend: Box<dyn Backend> = if args.no_cache {
        backend
    } else {
        let dir = cache_dir(&args.cache_dir, &args.model, &args.model_args);
        info!(dir = %dir.display(), "Caching responses");
        Box::new(CachingBackend::new(backend, dir)?)
    };

    let config = EvalConfig {
        num_fewshot: args.num_fewshot,
        prompt_modes: prompt_modes.clone(),
        limit: args.limit,
        bootstrap_iters: args.bootstrap_iters,
        fewshot_seed: args.seed,
        description_dict: description_dict.clone(),
        conversation_template,
        prompt_as_single_user_message: args.prompt_as_single_user_message,
        output_dir: args.output_path.as_deref().map(output_dir),
        batch_size: args.batch_size,
        progress_bar: !args.quiet,
        ..EvalConfig::default()
    };

    let mut results = simple_evaluate(
        &task_names,
        &args.data_dir,
        backend.as_mut(),
        &config,
        args.check_integrity,
    )?;
    results.config = Some(RunConfig {
        model: args.model.clone(),
        model_args: args.model_args.clone(),
        num_fewshot: args.num_fewshot,
        prompt_modes: prompt_modes.iter().map(ToString::to_string).collect(),
        batch_size: args.batch_size,
        limit: args.limit,
        bootstrap_iters: args.bootstrap_iters,
        seed: args.seed,
        no_cache: args.no_cache,
        description_dict,
        conversation_template: conversation_template.map(|template| template.to_string()),
        prompt_as_single_user_message: args.prompt_as_single_user_message,
    });

    let dumped = results.to_json()?;
    println!("{dumped}");
    if let Some(path) = &args.output_path {
        std::fs::write(path, &dumped)
            .with_context(|| format!("writing results to {}", path.display()))?;
    }

    println!(
        "{} ({}), limit: {:?}, num_fewshot: {}, batch_size: {:?}",
        args.model, args.model_args, args.limit, args.num_fewshot, args.batch_size
    );
    println!("{}", make_table(&results));
    Ok(())
}
