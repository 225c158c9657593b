use std::time::Duration;

use serde::{Deserialize, Serialize};

use durq::{Job, Queue, Worker};

#[derive(Serialize, Deserialize)]
struct SendEmailArgs {
    to: String,
    subject: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let queue = Queue::builder("sqlite://demos/jobs.db?mode=rwc")
        .timeout(Duration::from_secs(30))
        .maintenance_interval(Duration::from_secs(1))
        .on_processing_jobs_requeued(|count| {
            if count > 0 {
                println!("requeued {count} abandoned jobs");
            }
        })
        .build()
        .await?;

    // Fire-and-forget
    let id = queue
        .add(
            "send_email",
            &SendEmailArgs {
                to: "user@example.com".to_string(),
                subject: "Welcome!".to_string(),
            },
        )
        .await?;
    println!("enqueued job {id}");

    // Recurring job (cron, every minute)
    queue.schedule("cleanup", "* * * * *").await?;

    let email_worker = Worker::builder(&queue, "send_email", |job: Job| async move {
        let args: SendEmailArgs = serde_json::from_str(&job.data).map_err(|e| e.to_string())?;
        println!("sending email to {} ({})", args.to, args.subject);
        Ok(())
    })
    .on_completed(|job| println!("job {} completed", job.id))
    .on_failed(|job, error| println!("job {} failed: {error}", job.id))
    .build();

    let cleanup_worker = Worker::new(&queue, "cleanup", |_job: Job| async move {
        println!("running cleanup");
        Ok(())
    });

    email_worker.start().await;
    cleanup_worker.start().await;

    tokio::time::sleep(Duration::from_secs(65)).await;

    println!("job info: {:?}", queue.get_job_by_id(id).await?);
    println!("job types: {:?}", queue.get_job_types().await?);

    email_worker.stop().await;
    cleanup_worker.stop().await;
    queue.close().await;

    Ok(())
}
