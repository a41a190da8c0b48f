use anyhow::Context;
use quill_api::{AuthToken, NewUser, ThreadEntry, UserId, Uuid};

#[derive(structopt::StructOpt)]
struct Opt {
    #[structopt(short, long)]
    host: String,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(structopt::StructOpt)]
enum Command {
    /// Create a user
    CreateUser {
        /// Username
        name: String,

        /// Initial password
        initial_password: String,
    },

    /// Print the active comments of a thread group, indented by depth
    ShowThread {
        /// Post the group belongs to
        post: Uuid,

        /// Group id, starting at 1 for the first top-level comment of the post
        group: i64,
    },
}

fn admin_token() -> anyhow::Result<AuthToken> {
    let tok =
        std::env::var("ADMIN_TOKEN").context("retrieving ADMIN_TOKEN environment variable")?;
    let tok = Uuid::try_parse(&tok).context("parsing ADMIN_TOKEN as an auth token")?;
    Ok(AuthToken(tok))
}

fn print_entry(e: &ThreadEntry) {
    let indent = "  ".repeat(usize::try_from(e.comment.depth - 1).unwrap_or(0));
    let marker = if e.deleted_ancestor {
        " (reply to a deleted comment)"
    } else {
        ""
    };
    println!("{indent}#{} {:?}{marker}", e.position, e.comment.id.0);
    for line in e.comment.content.lines() {
        println!("{indent}  {line}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = <Opt as structopt::StructOpt>::from_args();

    let client = reqwest::Client::new();

    match opt.cmd {
        Command::CreateUser {
            name,
            initial_password,
        } => {
            let hash = bcrypt::hash(&initial_password, bcrypt::DEFAULT_COST)
                .context("hashing initial password")?;
            client
                .post(format!("{}/api/admin/create-user", opt.host))
                .json(&NewUser::new(UserId(Uuid::new_v4()), name, hash))
                .bearer_auth(admin_token()?.0)
                .send()
                .await?
                .error_for_status()?;
        }
        Command::ShowThread { post, group } => {
            let entries: Vec<ThreadEntry> = client
                .get(format!("{}/api/posts/{post}/groups/{group}", opt.host))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await
                .context("parsing thread listing")?;
            if entries.is_empty() {
                println!("no active comment in group {group} of post {post}");
            }
            for e in &entries {
                print_entry(e);
            }
        }
    }

    Ok(())
}
