//! Tarry CLI - run a sample suspendable workflow and manage configuration

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tarry::runtime::config::{load_config, write_config};
use tarry::runtime::{
    ActivityBehavior, Argument, ArgumentDirection, Bookmark, BookmarkOptions,
    BookmarkResumptionResult, ChildCallbacks, CodeActivity, CodeActivityContext,
    CustomTrackingRecord, DefinitionBuilder, DynValue, LocationReference, MemoryTrackingSink,
    NativeActivity, NativeActivityContext, NodeKey, RuntimeConfig, WorkflowExecutor, boxed, unbox,
};

#[derive(Parser)]
#[command(name = "tarry")]
#[command(about = "Suspendable activity execution core", long_about = None)]
struct Cli {
    /// Configuration file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow that waits on a bookmark, then resume it
    Demo {
        /// Value delivered to the bookmark
        #[arg(long, default_value = "hello")]
        value: String,

        /// Bookmark name the workflow waits on
        #[arg(long, default_value = "input")]
        bookmark: String,
    },

    /// Write a default configuration file
    InitConfig {
        /// Destination path
        #[arg(default_value = "tarry.json")]
        path: PathBuf,
    },
}

/// Waits for input, stores it, then runs the echo child
struct AwaitInput {
    bookmark: String,
    input: LocationReference,
    echo: NodeKey,
}

impl NativeActivity for AwaitInput {
    fn execute(&self, context: &mut NativeActivityContext) -> anyhow::Result<()> {
        context.create_bookmark(&self.bookmark, BookmarkOptions::NONE)?;
        Ok(())
    }

    fn on_bookmark_resumed(
        &self,
        context: &mut NativeActivityContext,
        _bookmark: &Bookmark,
        value: DynValue,
    ) -> anyhow::Result<()> {
        let text: String = unbox(value)?;
        context.set_value(&self.input, text)?;
        context.schedule_activity(self.echo, ChildCallbacks::COMPLETION)?;
        Ok(())
    }
}

/// Tracks the text it receives
struct Echo {
    text: LocationReference,
}

impl CodeActivity for Echo {
    fn execute(&self, context: &mut CodeActivityContext) -> anyhow::Result<()> {
        let text: String = context.get_value(&self.text)?;
        context.track(CustomTrackingRecord::new("echo").with("text", text))?;
        Ok(())
    }
}

fn demo(config: RuntimeConfig, value: String, bookmark: String) -> anyhow::Result<()> {
    let input = LocationReference::new::<String>("input");
    let text = Argument::new::<String>("text", ArgumentDirection::In).bind_reference(&input);
    let echo_text = text.reference().clone();

    let mut builder = DefinitionBuilder::new().with_max_id(config.max_activity_id);
    let echo = builder.add("Echo", ActivityBehavior::code(Echo { text: echo_text }));
    let root = builder.add(
        "AwaitInput",
        ActivityBehavior::native(AwaitInput {
            bookmark: bookmark.clone(),
            input: input.clone(),
            echo,
        }),
    );
    builder
        .add_child(root, echo)
        .add_variable(root, &input)
        .add_argument(echo, text);
    let definition = Arc::new(builder.build(root)?);

    let sink = Arc::new(MemoryTrackingSink::new());
    let executor = WorkflowExecutor::new(definition, config)?;
    executor.set_tracking_sink(sink.clone());

    executor.start()?;
    let status = executor.run()?;
    println!("after start: {:?}", status);
    for info in executor.bookmarks() {
        println!("  waiting on {} ({})", info.bookmark, info.activity);
    }

    match executor.resume_bookmark(&Bookmark::named(&bookmark), boxed(value))? {
        BookmarkResumptionResult::Success => {}
        other => anyhow::bail!("resumption of '{}' failed: {:?}", bookmark, other),
    }
    let status = executor.run()?;
    println!("after resume: {:?}", status);

    for record in sink.take() {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path).with_context(|| format!("Failed to load {:?}", path))?,
        None => RuntimeConfig::default(),
    };

    let level = if config.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    match cli.command {
        Commands::Demo { value, bookmark } => demo(config, value, bookmark)?,
        Commands::InitConfig { path } => {
            write_config(&path, &RuntimeConfig::default())?;
            println!("Wrote default configuration to {:?}", path);
        }
    }

    Ok(())
}
